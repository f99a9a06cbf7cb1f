//! End-to-end pool flows over the in-memory collaborators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rigpool_clients::{InventoryClient, MemoryInventory, MemoryProvisioner, ScriptedExec};
use rigpool_core::{
    Deployment, EnvironmentManager, FeatureCatalog, LifecycleConfig, NodeLifecycleController,
    PoolAllocator, PoolConfig, PoolContext, PoolError, ProvisionedBackend, RetrySearch,
    SearchPolicy,
};
use rigpool_model::{MachineRecord, NETWORK_INTERFACES_ROLE};
use serde_json::json;

struct Pool {
    inventory: Arc<MemoryInventory>,
    provisioner: Arc<MemoryProvisioner>,
    exec: Arc<ScriptedExec>,
    ctx: PoolContext,
    search: RetrySearch,
}

fn pool(machines: usize) -> Pool {
    let inventory = Arc::new(MemoryInventory::new());
    let provisioner = Arc::new(MemoryProvisioner::new());
    let exec = Arc::new(ScriptedExec::new());

    for i in 1..=machines {
        let handle = format!("am-pool{i}");
        provisioner.add_model(&handle, "secret");
        inventory.insert_machine(
            MachineRecord::new(format!("qa-centos-pool{i}"), format!("10.0.0.{i}"))
                .with_run_list([NETWORK_INTERFACES_ROLE])
                .with_handle(handle),
        );
    }

    let ctx = PoolContext::new(inventory.clone(), provisioner.clone(), exec.clone());
    let search = RetrySearch::new(Arc::clone(&ctx.inventory), SearchPolicy::default());
    Pool {
        inventory,
        provisioner,
        exec,
        ctx,
        search,
    }
}

fn allocator(pool: &Pool) -> PoolAllocator {
    PoolAllocator::new(&pool.ctx, pool.search.clone(), PoolConfig::default())
}

fn lifecycle(pool: &Pool) -> NodeLifecycleController {
    NodeLifecycleController::new(
        pool.ctx.clone(),
        Arc::new(ProvisionedBackend::new(Arc::clone(&pool.ctx.provisioner))),
        LifecycleConfig::default(),
    )
}

fn in_env(pool: &Pool, env: &str) -> usize {
    pool.inventory
        .machines()
        .iter()
        .filter(|m| m.environment == env)
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_twelve_machine_scenario() {
    let pool = pool(12);
    let allocator = allocator(&pool);

    let first = allocator.allocate("centos", "envA", 10).await.unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(in_env(&pool, "envA"), 10);

    let second = allocator.allocate("centos", "envA", 5).await.unwrap();
    assert_eq!(second.len(), 5);
    // Query order puts the existing members first, so nothing new is taken.
    assert_eq!(in_env(&pool, "envA"), 10);
    for name in &second {
        assert_eq!(pool.inventory.machine(name).unwrap().environment, "envA");
    }

    let mut distinct = second.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 5);

    let err = allocator.allocate("centos", "envB", 3).await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::InsufficientCapacity {
            requested: 3,
            available: 2
        }
    ));
    assert_eq!(in_env(&pool, "envB"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_allocation_survives_index_lag() {
    let pool = pool(3);
    pool.inventory.set_stale_searches(2);

    let taken = allocator(&pool).allocate("centos", "envA", 3).await.unwrap();

    assert_eq!(taken.len(), 3);
    assert_eq!(pool.inventory.query_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_prepare_allocate_and_teardown() {
    let pool = pool(4);
    let catalog = FeatureCatalog::default().with_feature(
        "ha",
        json!({"ha": {"enabled": true}})
            .as_object()
            .cloned()
            .unwrap(),
    );
    let environments = EnvironmentManager::new(
        Arc::clone(&pool.ctx.inventory),
        pool.search.clone(),
        catalog,
    );
    let lifecycle = lifecycle(&pool);

    let env = environments
        .prepare("ci", "centos", "grizzly", &["ha".to_string()])
        .await
        .unwrap();
    assert_eq!(env, "ci-centos-grizzly-ha");

    let names = allocator(&pool).allocate("centos", &env, 2).await.unwrap();
    let mut deployment =
        Deployment::from_allocation("ci-run", env.clone(), &names, pool.inventory.as_ref())
            .await
            .unwrap();
    assert_eq!(deployment.machines().len(), 2);

    let environment_deleted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&environment_deleted);
    let inventory: Arc<dyn InventoryClient> = pool.inventory.clone();
    let env_name = env.clone();
    deployment.add_cleanup("delete environment", move || async move {
        inventory.delete_environment(&env_name).await?;
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    deployment.add_cleanup("always fails", || async { anyhow::bail!("no such bucket") });
    assert!(!environment_deleted.load(Ordering::SeqCst));

    let report = deployment.teardown(&lifecycle).await;

    assert_eq!(report.erased, names);
    assert!(report.failed.is_empty());
    assert_eq!(report.cleanup.succeeded, vec!["delete environment"]);
    assert_eq!(report.cleanup.failed.len(), 1);
    assert!(!report.is_clean());
    assert!(environment_deleted.load(Ordering::SeqCst));
    assert!(pool.inventory.environment(&env).is_none());
    for name in &names {
        assert!(pool.inventory.machine(name).is_none());
    }
    assert_eq!(pool.provisioner.released().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_continues_past_unreachable_machine() {
    let pool = pool(2);
    let names = allocator(&pool).allocate("centos", "envA", 2).await.unwrap();
    let deployment =
        Deployment::from_allocation("run", "envA", &names, pool.inventory.as_ref())
            .await
            .unwrap();
    pool.exec.fail_address("10.0.0.1");

    let report = deployment.teardown(&lifecycle(&pool)).await;

    assert_eq!(report.erased, vec!["qa-centos-pool2"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].machine, "qa-centos-pool1");
    assert!(pool.inventory.machine("qa-centos-pool1").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_records_failed_release_and_continues() {
    let pool = pool(2);
    let names = allocator(&pool).allocate("centos", "envA", 2).await.unwrap();
    let mut deployment =
        Deployment::from_allocation("run", "envA", &names, pool.inventory.as_ref())
            .await
            .unwrap();
    let cleanup_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleanup_ran);
    deployment.add_cleanup("mark", move || async move {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    pool.provisioner.set_fail_releases(true);

    let report = deployment.teardown(&lifecycle(&pool)).await;

    assert_eq!(report.environment, "envA");
    assert!(report.erased.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.failed[0].machine, "qa-centos-pool1");
    assert!(report.failed[0].reason.contains("am-pool1"));
    assert_eq!(report.failed[1].machine, "qa-centos-pool2");
    assert!(report.failed[1].reason.contains("am-pool2"));
    assert!(cleanup_ran.load(Ordering::SeqCst));
    assert!(pool.provisioner.is_active("am-pool1"));
    assert!(pool.provisioner.is_active("am-pool2"));
}

#[tokio::test]
async fn test_from_allocation_requires_known_machines() {
    let pool = pool(1);
    let err = Deployment::from_allocation(
        "run",
        "envA",
        &["qa-centos-pool9".to_string()],
        pool.inventory.as_ref(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, PoolError::NotFound { kind: "machine", .. }));
}

#[tokio::test(start_paused = true)]
async fn test_settle_delay_orders_erase_before_next_search() {
    let pool = pool(1);
    let lifecycle = NodeLifecycleController::new(
        pool.ctx.clone(),
        Arc::new(ProvisionedBackend::new(Arc::clone(&pool.ctx.provisioner))),
        LifecycleConfig {
            settle_delay: Duration::from_secs(30),
            ..LifecycleConfig::default()
        },
    );
    let machine = pool.inventory.machine("qa-centos-pool1").unwrap();

    let start = tokio::time::Instant::now();
    lifecycle.erase(&machine).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(30));

    let outcome = pool
        .search
        .outcome_with(&rigpool_model::Query::pool("centos"), 1, Duration::ZERO)
        .await
        .unwrap();
    assert!(outcome.is_exhausted());
}
