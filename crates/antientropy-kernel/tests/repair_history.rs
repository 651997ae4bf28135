use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use antientropy_kernel::{
    HistoryStore, InMemoryHistoryStore, Node, RepairEntry, RepairError, RepairHistory,
    RepairHistoryProvider, RepairStatus, SessionStateError, StaticReplicationState,
    TableReference, TokenRange,
};
use chrono::{Duration, Utc};
use uuid::Uuid;

struct Fixture {
    table: TableReference,
    local: Node,
    remote: Node,
    store: Arc<InMemoryHistoryStore>,
    topology: Arc<StaticReplicationState>,
    history: RepairHistory,
}

fn fixture() -> Fixture {
    let table = TableReference::new("ks", "tbl", Uuid::new_v4());
    let local = Node::new(Uuid::new_v4(), "dc1");
    let remote = Node::new(Uuid::new_v4(), "dc1");
    let store = Arc::new(InMemoryHistoryStore::new());
    let topology = Arc::new(StaticReplicationState::new());
    topology.set_local_range(
        &table,
        TokenRange::new(1, 2),
        [local.clone(), remote.clone()],
    );
    topology.set_local_range(
        &table,
        TokenRange::new(2, 3),
        [local.clone(), remote.clone()],
    );
    let history = RepairHistory::builder()
        .with_local_node(local.clone())
        .with_store(store.clone())
        .with_replication_state(topology.clone())
        .with_page_size(2)
        .build()
        .expect("build repair history");
    Fixture {
        table,
        local,
        remote,
        store,
        topology,
        history,
    }
}

fn participants(f: &Fixture) -> BTreeSet<Node> {
    [f.local.clone(), f.remote.clone()].into_iter().collect()
}

fn collect_local(f: &Fixture) -> Vec<RepairEntry> {
    let now = Utc::now();
    f.history
        .iterate(
            &f.table,
            now + Duration::seconds(5),
            now - Duration::seconds(5),
            &|_| true,
        )
        .collect::<Result<Vec<_>, _>>()
        .expect("iterate history")
}

#[test]
fn start_and_succeed_writes_one_row_per_participant() {
    let f = fixture();
    let job_id = Uuid::new_v4();
    let mut session = f
        .history
        .new_session(&f.table, job_id, TokenRange::new(1, 2), &participants(&f));
    assert!(!session.is_noop());
    session.start().expect("start");
    session.finish(RepairStatus::Success).expect("finish");

    let repair_id = session.repair_id().expect("active session has an id");
    assert_eq!(f.store.len(), 2);
    for node in [&f.local, &f.remote] {
        let row = f
            .store
            .get(f.table.id, node.id, &repair_id)
            .expect("get row")
            .expect("row exists");
        assert_eq!(row.status, RepairStatus::Success);
        assert_eq!(row.job_id, job_id);
        assert_eq!(row.coordinator_id, f.local.id);
        assert_eq!(row.started_at, repair_id.timestamp());
        assert!(row.finished_at.expect("finished") >= row.started_at);
    }

    let entries = collect_local(&f);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].participants, participants(&f));
    assert_eq!(entries[0].range, TokenRange::new(1, 2));
}

#[test]
fn unknown_range_yields_noop_session_writing_nothing() {
    let f = fixture();
    let mut session = f.history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(5, 6),
        &participants(&f),
    );
    assert!(session.is_noop());
    session.start().expect("noop start");
    session.finish(RepairStatus::Success).expect("noop finish");
    assert!(f.store.is_empty());
    assert!(collect_local(&f).is_empty());

    let only_local: BTreeSet<Node> = [f.local.clone()].into_iter().collect();
    let session = f
        .history
        .new_session(&f.table, Uuid::new_v4(), TokenRange::new(1, 2), &only_local);
    assert!(session.is_noop());
}

#[test]
fn start_and_fail_records_failed_status() {
    let f = fixture();
    let mut session = f.history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(1, 2),
        &participants(&f),
    );
    session.start().expect("start");
    session.finish(RepairStatus::Failed).expect("finish");

    let entries = collect_local(&f);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, RepairStatus::Failed);
    assert!(entries[0].finished_at.expect("finished") >= entries[0].started_at);
}

#[test]
fn started_entry_has_no_finish_time() {
    let f = fixture();
    let mut session = f.history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(1, 2),
        &participants(&f),
    );
    session.start().expect("start");
    let entries = collect_local(&f);
    assert_eq!(entries[0].status, RepairStatus::Started);
    assert!(entries[0].finished_at.is_none());
}

#[test]
fn iteration_is_reverse_chronological_across_pages() {
    let f = fixture();
    let mut ids = Vec::new();
    for range in [
        TokenRange::new(1, 2),
        TokenRange::new(2, 3),
        TokenRange::new(1, 2),
        TokenRange::new(2, 3),
        TokenRange::new(1, 2),
    ] {
        let mut session =
            f.history
                .new_session(&f.table, Uuid::new_v4(), range, &participants(&f));
        session.start().expect("start");
        session.finish(RepairStatus::Success).expect("finish");
        ids.push(session.repair_id().expect("id"));
    }

    let entries = collect_local(&f);
    let got: Vec<_> = entries.iter().map(|e| e.repair_id).collect();
    ids.reverse();
    assert_eq!(got, ids);
    assert!(got.windows(2).all(|w| w[0] > w[1]));
    assert_eq!(entries[0].range, TokenRange::new(1, 2));
    assert_eq!(entries[1].range, TokenRange::new(2, 3));
}

#[test]
fn predicate_filters_lazily() {
    let f = fixture();
    for range in [TokenRange::new(1, 2), TokenRange::new(2, 3)] {
        let mut session =
            f.history
                .new_session(&f.table, Uuid::new_v4(), range, &participants(&f));
        session.start().expect("start");
        session.finish(RepairStatus::Success).expect("finish");
    }
    let now = Utc::now();
    let wanted = TokenRange::new(1, 2);
    let predicate = |e: &RepairEntry| e.range == wanted;
    let entries: Vec<_> = f
        .history
        .iterate(
            &f.table,
            now + Duration::seconds(1),
            now - Duration::seconds(1),
            &predicate,
        )
        .collect::<Result<_, _>>()
        .expect("iterate");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].range, wanted);
}

#[test]
fn node_form_reads_remote_partitions() {
    let f = fixture();
    let remote_only = Node::new(Uuid::new_v4(), "dc2");
    f.topology
        .set_remote_range(&f.table, TokenRange::new(10, 20), [remote_only.clone()]);

    let mut local = f.history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(1, 2),
        &participants(&f),
    );
    local.start().expect("start local");
    local.finish(RepairStatus::Success).expect("finish local");

    let remote_topology = Arc::new(StaticReplicationState::new());
    remote_topology.set_local_range(&f.table, TokenRange::new(10, 20), [remote_only.clone()]);
    let remote_history = RepairHistory::builder()
        .with_local_node(remote_only.clone())
        .with_store(f.store.clone())
        .with_replication_state(remote_topology)
        .build()
        .expect("remote history");
    let expected: BTreeSet<Node> = [remote_only.clone()].into_iter().collect();
    let mut remote = remote_history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(10, 20),
        &expected,
    );
    remote.start().expect("start remote");
    remote.finish(RepairStatus::Success).expect("finish remote");

    let local_entries = collect_local(&f);
    assert_eq!(local_entries.len(), 1);
    assert_eq!(local_entries[0].range, TokenRange::new(1, 2));

    let now = Utc::now();
    let remote_entries: Vec<_> = f
        .history
        .iterate_node(
            remote_only.id,
            &f.table,
            now + Duration::seconds(5),
            now - Duration::seconds(5),
            &|_| true,
        )
        .collect::<Result<_, _>>()
        .expect("iterate remote");
    assert_eq!(remote_entries.len(), 1);
    assert_eq!(remote_entries[0].range, TokenRange::new(10, 20));
    assert_eq!(remote_entries[0].participants, expected);
}

#[test]
fn session_state_machine_rejects_reuse() {
    let f = fixture();
    let mut session = f.history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(1, 2),
        &participants(&f),
    );
    assert!(matches!(
        session.finish(RepairStatus::Success),
        Err(RepairError::SessionState(SessionStateError::NotStarted))
    ));
    session.start().expect("start");
    session.finish(RepairStatus::Success).expect("finish");

    assert!(matches!(
        session.start(),
        Err(RepairError::SessionState(SessionStateError::AlreadyUsed))
    ));
    for status in [
        RepairStatus::Success,
        RepairStatus::Failed,
        RepairStatus::Unknown,
    ] {
        assert!(matches!(
            session.finish(status),
            Err(RepairError::SessionState(SessionStateError::AlreadyFinished))
        ));
    }
}

#[test]
fn second_start_is_rejected_while_running() {
    let f = fixture();
    let mut session = f.history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(1, 2),
        &participants(&f),
    );
    session.start().expect("start");
    assert!(matches!(
        session.start(),
        Err(RepairError::SessionState(SessionStateError::AlreadyUsed))
    ));
}

#[test]
fn entry_is_found_within_one_millisecond_window() {
    let f = fixture();
    let mut session = f.history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(2, 3),
        &participants(&f),
    );
    session.start().expect("start");
    session.finish(RepairStatus::Success).expect("finish");
    let repair_id = session.repair_id().expect("id");
    let started_at = repair_id.timestamp();

    let entries: Vec<_> = f
        .history
        .iterate(
            &f.table,
            started_at + Duration::milliseconds(1),
            started_at - Duration::milliseconds(1),
            &|_| true,
        )
        .collect::<Result<_, _>>()
        .expect("iterate");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].repair_id, repair_id);

    let exact: Vec<_> = f
        .history
        .iterate(&f.table, started_at, started_at, &|_| true)
        .collect::<Result<_, _>>()
        .expect("iterate exact");
    assert_eq!(exact.len(), 1);
}

#[test]
fn reads_are_clamped_to_lookback() {
    let table = TableReference::new("ks", "tbl", Uuid::new_v4());
    let local = Node::new(Uuid::new_v4(), "dc1");
    let store = Arc::new(InMemoryHistoryStore::new());
    let topology = Arc::new(StaticReplicationState::new());
    topology.set_local_range(&table, TokenRange::new(1, 2), [local.clone()]);
    let history = RepairHistory::builder()
        .with_local_node(local.clone())
        .with_store(store.clone())
        .with_replication_state(topology)
        .with_lookback(StdDuration::from_secs(60))
        .build()
        .expect("history");
    assert_eq!(history.lookback(), Duration::seconds(60));

    let old = antientropy_kernel::TimeUuid::from_unix_millis(
        (Utc::now() - Duration::minutes(10)).timestamp_millis(),
    );
    store
        .insert(&antientropy_kernel::HistoryRow {
            table_id: table.id,
            node_id: local.id,
            repair_id: old,
            job_id: Uuid::new_v4(),
            coordinator_id: local.id,
            range_begin: "1".into(),
            range_end: "2".into(),
            status: RepairStatus::Success,
            started_at: old.timestamp(),
            finished_at: Some(old.timestamp()),
        })
        .expect("insert old row");

    let now = Utc::now();
    let entries: Vec<_> = history
        .iterate(&table, now, now - Duration::hours(1), &|_| true)
        .collect::<Result<_, _>>()
        .expect("iterate");
    assert!(entries.is_empty());
}

#[test]
fn failed_start_surfaces_driver_error_and_finish_is_best_effort() {
    let f = fixture();
    let mut session = f.history.new_session(
        &f.table,
        Uuid::new_v4(),
        TokenRange::new(1, 2),
        &participants(&f),
    );
    f.store.set_unavailable(true);
    let err = session.start().expect_err("store is down");
    assert!(err.is_transient());
    f.store.set_unavailable(false);

    session
        .finish(RepairStatus::Failed)
        .expect("finish touches only existing rows");
    assert!(f.store.is_empty());
}

#[test]
fn store_error_ends_iteration() {
    let f = fixture();
    f.store.set_unavailable(true);
    let now = Utc::now();
    let any = |_: &RepairEntry| true;
    let mut iter = f
        .history
        .iterate(&f.table, now, now - Duration::seconds(5), &any);
    assert!(matches!(iter.next(), Some(Err(RepairError::Driver(_)))));
    assert!(iter.next().is_none());
}

#[test]
fn builder_requires_collaborators() {
    let err = RepairHistory::builder()
        .with_store(Arc::new(InMemoryHistoryStore::new()))
        .build()
        .err()
        .expect("missing local node");
    assert!(matches!(err, RepairError::Config(msg) if msg.contains("local node")));
}
