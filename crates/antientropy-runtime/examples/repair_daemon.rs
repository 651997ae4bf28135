//! Simulated repair daemon: a three node cluster, two tables, a fake repair RPC.
//!
//! Run with:
//!   cargo run -p antientropy-runtime --example repair_daemon -- --seconds 3
//!   cargo run -p antientropy-runtime --example repair_daemon --features sqlite-persistence -- --db repair_history.db
//!
//! Set `RUST_LOG=antientropy_runtime=debug` to watch individual tasks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use antientropy_kernel::{
    HistoryStore, InMemoryHistoryStore, Node, RepairError, StaticReplicationState,
    TableReference, TokenRange,
};
use antientropy_runtime::{
    Collaborators, InMemoryLockService, RepairConfiguration, RepairLockType, RepairRpc,
    RepairSchedulerService, SchedulerConfig,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

struct Args {
    seconds: u64,
    db_path: Option<String>,
}

fn parse_args(args: &[String]) -> Option<Args> {
    // [--seconds <n>] [--db <path>]
    let mut i = 0;
    let mut parsed = Args {
        seconds: 3,
        db_path: None,
    };
    while i < args.len() {
        if args[i] == "--seconds" && i + 1 < args.len() {
            parsed.seconds = args[i + 1].parse().ok()?;
            i += 2;
            continue;
        }
        if args[i] == "--db" && i + 1 < args.len() {
            parsed.db_path = Some(args[i + 1].clone());
            i += 2;
            continue;
        }
        return None;
    }
    Some(parsed)
}

#[cfg(feature = "sqlite-persistence")]
fn history_store(db_path: Option<&str>) -> Result<Arc<dyn HistoryStore>, RepairError> {
    match db_path {
        Some(path) => Ok(Arc::new(antientropy_kernel::SqliteHistoryStore::new(path)?)),
        None => Ok(Arc::new(InMemoryHistoryStore::new())),
    }
}

#[cfg(not(feature = "sqlite-persistence"))]
fn history_store(db_path: Option<&str>) -> Result<Arc<dyn HistoryStore>, RepairError> {
    if db_path.is_some() {
        return Err(RepairError::Config(
            "--db requires the sqlite-persistence feature".into(),
        ));
    }
    Ok(Arc::new(InMemoryHistoryStore::new()))
}

/// Splits the ring into `parts` ranges, each replicated by three consecutive nodes.
fn build_topology(
    tables: &[TableReference],
    nodes: &[Node],
    parts: i64,
) -> StaticReplicationState {
    let topology = StaticReplicationState::new();
    let step = u64::MAX / parts as u64;
    for i in 0..parts {
        let start = (i64::MIN as i128 + (step as i128) * i as i128) as i64;
        let end = if i + 1 == parts {
            i64::MIN
        } else {
            (i64::MIN as i128 + (step as i128) * (i + 1) as i128) as i64
        };
        let replicas: BTreeSet<Node> = (0..3)
            .map(|k| nodes[(i as usize + k) % nodes.len()].clone())
            .collect();
        for table in tables {
            if replicas.contains(&nodes[0]) {
                topology.set_local_range(table, TokenRange::new(start, end), replicas.clone());
            } else {
                topology.set_remote_range(table, TokenRange::new(start, end), replicas.clone());
            }
        }
    }
    topology
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(args) = parse_args(&args) else {
        eprintln!("Usage: repair_daemon [--seconds <n>] [--db <path>]");
        std::process::exit(1);
    };

    let nodes: Vec<Node> = ["dc1", "dc1", "dc2"]
        .into_iter()
        .map(|dc| Node::new(Uuid::new_v4(), dc))
        .collect();
    let tables = vec![
        TableReference::new("shop", "orders", Uuid::new_v4()),
        TableReference::new("shop", "customers", Uuid::new_v4()),
    ];
    let topology = Arc::new(build_topology(&tables, &nodes, 6));

    let rpc: Arc<dyn RepairRpc> = Arc::new(
        |table: &TableReference, range: &TokenRange, participants: &BTreeSet<Node>| {
            std::thread::sleep(Duration::from_millis(50));
            if range.start % 7 == 0 {
                return Err(RepairError::Rpc(format!("simulated failure on {table} {range}")));
            }
            tracing::debug!(table = %table, range = %range, replicas = participants.len(), "simulated repair");
            Ok(())
        },
    );

    let config = SchedulerConfig {
        repair_lock_type: RepairLockType::DatacenterAndVnode,
        tick_interval: Duration::from_millis(100),
        worker_count: 2,
        ..SchedulerConfig::default()
    };
    let collaborators = Collaborators::new(
        nodes[0].clone(),
        history_store(args.db_path.as_deref())?,
        topology,
        Arc::new(InMemoryLockService::new()),
        rpc,
    );
    let service =
        RepairSchedulerService::activate(&config, collaborators, &tokio::runtime::Handle::current())?;
    for table in &tables {
        service.scheduler().put_configuration(
            table.clone(),
            RepairConfiguration {
                parallelism: 2,
                unwind_ratio: 0.5,
                ..RepairConfiguration::default()
            },
        )?;
    }

    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    let views = service.scheduler().list_current_jobs();
    println!("{}", serde_json::to_string_pretty(&views)?);
    service.deactivate().await;
    Ok(())
}
