//! Integration tests for the Tollgate approval engine.
//!
//! These tests drive initiatives end to end:
//! - Full lifecycle through all eleven stages
//! - Conditional stages resolved as bypassed
//! - Initiative Lead binding and reassignment
//! - Monitoring and timeline sub-workflows
//! - Rejection and concurrent decisions
//! - Reporting snapshots
//! - State persistence (Memory and SQLite)

use chrono::NaiveDate;
use rust_decimal::Decimal;

use tollgate::{
    seed_directory, Decision, Identity, Initiative, InitiativeStatus, MemoryStateStore,
    MonitoringMonth, NewInitiative, ReportFilter, ReportSnapshot, RoleCode, SeedConfig,
    StageDetails, StageStatus, StateStore, TollgateConfig, TollgateError, TransitionEngine,
    TransitionKind, WorkflowEvent,
};

const INITIATOR: &str = "stld@nds.example";
const LEAD: &str = "il@nds.example";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn who(identity: &str) -> Identity {
    Identity::new(identity)
}

async fn seeded_engine<S: StateStore>(store: &mut S) -> TransitionEngine {
    init_tracing();
    let engine = TransitionEngine::default();
    seed_directory(store, engine.catalog(), &SeedConfig::demo())
        .await
        .expect("seed should succeed");
    engine
}

async fn decide<S: StateStore>(
    engine: &TransitionEngine,
    store: &mut S,
    initiative: &Initiative,
    actor: &str,
    decision: Decision,
) -> Initiative {
    engine
        .advance(initiative, &who(actor), decision, store)
        .await
        .unwrap_or_else(|e| panic!("stage {} by {} failed: {}", initiative.current_stage, actor, e))
        .initiative
}

fn draft() -> NewInitiative {
    NewInitiative::new("Steam trap survey", "NDS")
        .with_discipline("Mechanical")
        .with_expected_savings(Decimal::new(120_000, 0))
}

/// Registers an initiative and approves stages 1 through 3.
async fn through_responsibilities<S: StateStore>(
    engine: &TransitionEngine,
    store: &mut S,
    engineering_change: bool,
    capital: bool,
) -> Initiative {
    let initiative = engine
        .register(draft(), who(INITIATOR), store)
        .await
        .expect("register should succeed");
    let initiative = decide(engine, store, &initiative, INITIATOR, Decision::approve()).await;
    let initiative = decide(engine, store, &initiative, "sh@nds.example", Decision::approve()).await;
    decide(
        engine,
        store,
        &initiative,
        "eh@nds.example",
        Decision::assign_responsibilities(LEAD, engineering_change, capital),
    )
    .await
}

/// Records one finalized, finance-approved month for the initiative.
async fn settle_month<S: StateStore>(engine: &TransitionEngine, store: &mut S, initiative: &Initiative) {
    let mut monitoring = engine.monitoring(store);
    let entry = monitoring
        .record_entry(
            &initiative.id,
            MonitoringMonth::new(2025, 6).unwrap(),
            "Steam consumption (t)",
            Decimal::new(10_000, 0),
            RoleCode::SiteTsdLead,
        )
        .await
        .expect("record should succeed");
    monitoring.set_achieved(&entry.id, Decimal::new(9_500, 0)).await.unwrap();
    monitoring.finalize(&entry.id).await.unwrap();
    monitoring
        .finance_approve(&entry.id, true, Some("figures agreed".to_string()))
        .await
        .unwrap();
}

/// Approves stages 6 through 11 on the bound lead's path.
async fn through_closure<S: StateStore>(
    engine: &TransitionEngine,
    store: &mut S,
    initiative: Initiative,
) -> Initiative {
    assert_eq!(initiative.current_stage, 6);
    let initiative = decide(engine, store, &initiative, LEAD, Decision::approve()).await;
    let initiative = decide(engine, store, &initiative, "trial@nds.example", Decision::approve()).await;
    let initiative = decide(engine, store, &initiative, "ctsd@nds.example", Decision::approve()).await;
    settle_month(engine, store, &initiative).await;
    let initiative = decide(engine, store, &initiative, "monitoring@nds.example", Decision::approve()).await;
    let initiative = decide(
        engine,
        store,
        &initiative,
        "validation@nds.example",
        Decision::approve_with(StageDetails::SavingsValidated {
            actual_savings: Decimal::new(114_000, 0),
        }),
    )
    .await;
    decide(engine, store, &initiative, "closure@nds.example", Decision::approve()).await
}

#[tokio::test]
async fn test_full_lifecycle_with_memory_store() {
    let mut store = MemoryStateStore::new();
    let engine = seeded_engine(&mut store).await;
    let mut events = engine.subscribe();

    let initiative = through_responsibilities(&engine, &mut store, true, true).await;
    assert_eq!(initiative.current_stage, 4);
    assert_eq!(initiative.status, InitiativeStatus::InProgress);

    let initiative = decide(
        &engine,
        &mut store,
        &initiative,
        LEAD,
        Decision::approve_with(StageDetails::EngineeringChange {
            moc_number: "MOC-2025-017".to_string(),
        }),
    )
    .await;
    let initiative = decide(
        &engine,
        &mut store,
        &initiative,
        LEAD,
        Decision::approve_with(StageDetails::CapitalApproval {
            capex_number: "CX-88".to_string(),
        }),
    )
    .await;

    // Timeline milestones are open from stage 6 on.
    {
        let mut timeline = engine.timeline(&mut store);
        let milestone = timeline
            .record_milestone(
                &initiative.id,
                "Replace failed traps in boiler house",
                NaiveDate::from_ymd_opt(2025, 5, 12).unwrap(),
            )
            .await
            .unwrap();
        timeline.set_approval(&milestone.id, RoleCode::SiteTsdLead, true).await.unwrap();
        let approved = timeline
            .set_approval(&milestone.id, RoleCode::InitiativeLead, true)
            .await
            .unwrap();
        assert!(approved.is_complete());
    }

    let completed = through_closure(&engine, &mut store, initiative).await;
    assert_eq!(completed.status, InitiativeStatus::Completed);
    assert_eq!(completed.current_stage, 11);
    assert_eq!(completed.progress_percentage, 100);
    assert_eq!(completed.moc_number.as_deref(), Some("MOC-2025-017"));
    assert_eq!(completed.capex_number.as_deref(), Some("CX-88"));
    assert_eq!(completed.actual_savings, Some(Decimal::new(114_000, 0)));

    let status = engine.status(&completed.id, &store).await.unwrap();
    assert!(status.is_complete());
    assert_eq!(status.approved_stages(), (1..=11).collect::<Vec<_>>());
    assert!(status.bypassed_stages().is_empty());

    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    let approvals = collected
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StageApproved { .. }))
        .count();
    assert_eq!(approvals, 11);
    assert!(collected.iter().any(|e| matches!(e, WorkflowEvent::MilestoneApproved { .. })));
    assert!(collected.iter().any(|e| matches!(e, WorkflowEvent::FinanceReviewed { approved: true, .. })));
    assert!(matches!(collected.last(), Some(WorkflowEvent::InitiativeCompleted { .. })));

    let done = engine
        .advance(&completed, &who("closure@nds.example"), Decision::approve(), &mut store)
        .await;
    assert!(matches!(done, Err(TollgateError::WorkflowHalted { .. })));

    println!("{}", status);
}

#[tokio::test]
async fn test_bypass_path_completes_at_full_progress() {
    let mut store = MemoryStateStore::new();
    let engine = seeded_engine(&mut store).await;

    let initiative = through_responsibilities(&engine, &mut store, false, false).await;
    assert_eq!(initiative.current_stage, 6);

    let states = store.get_stage_states(&initiative.id).await.unwrap();
    assert_eq!(states[&4].status, StageStatus::Bypassed);
    assert_eq!(states[&5].status, StageStatus::Bypassed);

    // Stage 6 sits in the lead's queue.
    assert_eq!(engine.pending_for(&who(LEAD), &store).await.unwrap().len(), 1);

    let completed = through_closure(&engine, &mut store, initiative).await;
    assert_eq!(completed.status, InitiativeStatus::Completed);
    assert_eq!(completed.progress_percentage, 100);

    let status = engine.status(&completed.id, &store).await.unwrap();
    assert_eq!(status.bypassed_stages(), vec![4, 5]);
    assert_eq!(status.applicable_count(), 9);
}

#[tokio::test]
async fn test_initiative_lead_scoped_per_initiative() {
    let mut store = MemoryStateStore::new();
    let engine = seeded_engine(&mut store).await;

    let first = through_responsibilities(&engine, &mut store, true, false).await;
    let second = engine.register(draft(), who(INITIATOR), &mut store).await.unwrap();
    let second = decide(&engine, &mut store, &second, INITIATOR, Decision::approve()).await;
    let second = decide(&engine, &mut store, &second, "sh@nds.example", Decision::approve()).await;
    let second = decide(
        &engine,
        &mut store,
        &second,
        "eh@nds.example",
        Decision::assign_responsibilities("other-lead@nds.example", true, false),
    )
    .await;

    // Each lead can only act on their own initiative.
    let crossed = engine
        .advance(&second, &who(LEAD), Decision::approve(), &mut store)
        .await;
    assert!(matches!(crossed, Err(TollgateError::Unauthorized { stage: 4, .. })));

    let first = decide(&engine, &mut store, &first, LEAD, Decision::approve()).await;
    assert_eq!(first.current_stage, 6);
    let second = decide(&engine, &mut store, &second, "other-lead@nds.example", Decision::approve()).await;
    assert_eq!(second.current_stage, 6);

    // Reassignment moves the remaining lead stages.
    let first = engine
        .reassign_initiative_lead(&first.id, &who("eh@nds.example"), who("new-lead@nds.example"), &mut store)
        .await
        .unwrap();
    let stale = engine.advance(&first, &who(LEAD), Decision::approve(), &mut store).await;
    assert!(matches!(stale, Err(TollgateError::Unauthorized { stage: 6, .. })));
    let first = decide(&engine, &mut store, &first, "new-lead@nds.example", Decision::approve()).await;
    assert_eq!(first.current_stage, 7);
}

#[tokio::test]
async fn test_rejection_halts_subworkflows() {
    let mut store = MemoryStateStore::new();
    let engine = seeded_engine(&mut store).await;
    let mut events = engine.subscribe();

    let initiative = through_responsibilities(&engine, &mut store, false, false).await;
    let initiative = decide(&engine, &mut store, &initiative, LEAD, Decision::approve()).await;
    let initiative = decide(&engine, &mut store, &initiative, "trial@nds.example", Decision::approve()).await;

    let transition = engine
        .advance(
            &initiative,
            &who("ctsd@nds.example"),
            Decision::reject("trial savings below threshold"),
            &mut store,
        )
        .await
        .unwrap();
    assert_eq!(transition.kind, TransitionKind::Rejected);
    assert_eq!(transition.from_stage, 8);
    let rejected = transition.initiative;
    assert_eq!(rejected.status, InitiativeStatus::Rejected);
    assert_eq!(rejected.current_stage, 8);

    let recorded = engine
        .monitoring(&mut store)
        .record_entry(
            &rejected.id,
            MonitoringMonth::new(2025, 7).unwrap(),
            "Steam consumption (t)",
            Decimal::ONE,
            RoleCode::SiteTsdLead,
        )
        .await;
    assert!(matches!(recorded, Err(TollgateError::WorkflowHalted { .. })));

    let milestone = engine
        .timeline(&mut store)
        .record_milestone(&rejected.id, "late", NaiveDate::from_ymd_opt(2025, 8, 1).unwrap())
        .await;
    assert!(matches!(milestone, Err(TollgateError::WorkflowHalted { .. })));

    assert!(engine.pending_for(&who("ctsd@nds.example"), &store).await.unwrap().is_empty());

    let mut saw_rejection = false;
    while let Ok(event) = events.try_recv() {
        if let WorkflowEvent::StageRejected { stage, reason, .. } = event {
            assert_eq!(stage, 8);
            assert_eq!(reason, "trial savings below threshold");
            saw_rejection = true;
        }
    }
    assert!(saw_rejection);

    let status = engine.status(&rejected.id, &store).await.unwrap();
    assert_eq!(status.rejected_stage(), Some(8));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_decisions_commit_once() {
    let mut store = MemoryStateStore::new();
    let engine = seeded_engine(&mut store).await;
    let initiative = engine.register(draft(), who(INITIATOR), &mut store).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let mut store = store.clone();
        let snapshot = initiative.clone();
        handles.push(tokio::spawn(async move {
            engine
                .advance(&snapshot, &who(INITIATOR), Decision::approve(), &mut store)
                .await
        }));
    }

    let mut committed = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(transition) => {
                assert_eq!(transition.initiative.current_stage, 2);
                committed += 1;
            }
            Err(e) => {
                assert!(matches!(e, TollgateError::ConcurrentModification { .. }));
                assert!(e.is_retryable());
                conflicts += 1;
            }
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(conflicts, 7);

    let stored = store.get_initiative(&initiative.id).await.unwrap().unwrap();
    assert_eq!(stored.version, initiative.version + 1);
    assert_eq!(stored.current_stage, 2);
}

#[tokio::test]
async fn test_engine_from_config() {
    init_tracing();
    let config = TollgateConfig::from_toml_str(
        r#"
        [engine]
        require_monitoring_entries = true

        [[seed.sites]]
        site = "HSD"

        [[seed.sites.assignments]]
        stage = 2
        role = "SH"
        identity = "sh@hsd.example"
        "#,
    )
    .unwrap();

    let engine = TransitionEngine::from_config(&config);
    assert!(engine.settings().require_monitoring_entries);

    let mut store = MemoryStateStore::new();
    seed_directory(&mut store, engine.catalog(), &config.seed).await.unwrap();

    let initiative = engine
        .register(NewInitiative::new("Compressor leak audit", "HSD"), who("a@hsd.example"), &mut store)
        .await
        .unwrap();
    let initiative = decide(&engine, &mut store, &initiative, "a@hsd.example", Decision::approve()).await;
    let initiative = decide(&engine, &mut store, &initiative, "sh@hsd.example", Decision::approve()).await;

    let unassigned = engine
        .advance(&initiative, &who("eh@hsd.example"), Decision::approve(), &mut store)
        .await;
    assert!(matches!(unassigned, Err(TollgateError::Unassigned { stage: 3, .. })));
}

#[tokio::test]
async fn test_report_snapshot_after_lifecycle() {
    let mut store = MemoryStateStore::new();
    let engine = seeded_engine(&mut store).await;

    let initiative = through_responsibilities(&engine, &mut store, false, false).await;
    let completed = through_closure(&engine, &mut store, initiative).await;
    engine.register(draft(), who(INITIATOR), &mut store).await.unwrap();

    let snapshot = ReportSnapshot::collect(
        &store,
        engine.catalog(),
        &ReportFilter::fiscal_year(2025).for_site("NDS"),
    )
    .await
    .unwrap();

    let june = snapshot.sheet("Jun.25").expect("june sheet");
    assert_eq!(june.rows.len(), 2);
    let row = june
        .rows
        .iter()
        .find(|r| r.initiative_id == completed.id)
        .unwrap();
    assert_eq!(row.status, InitiativeStatus::Completed);
    assert_eq!(row.month_target, Decimal::new(10_000, 0));
    assert_eq!(row.month_achieved, Some(Decimal::new(9_500, 0)));
    assert_eq!(row.annualized_value, Some(Decimal::new(114_000, 0)));
    assert_eq!(june.total_achieved(), Decimal::new(9_500, 0));

    let pending = june.rows.iter().find(|r| r.initiative_id != completed.id).unwrap();
    assert_eq!(pending.annualized_value, Some(Decimal::new(120_000, 0)));
    assert_eq!(pending.entry_count, 0);
}

#[tokio::test]
#[cfg(feature = "sqlite")]
async fn test_full_lifecycle_with_sqlite_store() {
    use tollgate::SqliteStateStore;

    let mut store = SqliteStateStore::open_in_memory()
        .await
        .expect("sqlite should open");
    let engine = seeded_engine(&mut store).await;

    let initiative = through_responsibilities(&engine, &mut store, true, false).await;
    let initiative = decide(
        &engine,
        &mut store,
        &initiative,
        LEAD,
        Decision::approve_with(StageDetails::EngineeringChange {
            moc_number: "MOC-7".to_string(),
        }),
    )
    .await;
    assert_eq!(initiative.current_stage, 6);

    let completed = through_closure(&engine, &mut store, initiative).await;
    assert_eq!(completed.status, InitiativeStatus::Completed);
    assert_eq!(completed.progress_percentage, 100);

    let status = engine.status(&completed.id, &store).await.unwrap();
    assert_eq!(status.bypassed_stages(), vec![5]);
    assert_eq!(status.approved_stages().len(), 10);

    let stored = store.get_initiative(&completed.id).await.unwrap().unwrap();
    assert_eq!(stored.moc_number.as_deref(), Some("MOC-7"));
    assert_eq!(stored.initiative_lead, Some(who(LEAD)));
}
