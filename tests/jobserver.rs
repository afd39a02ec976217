//! Jobserver token-pool smoke tests: exercise the public `Jobserver`/`Token`
//! API end to end rather than the private platform backends directly.

use std::num::NonZeroUsize;

use jobgraph::{EngineConfig, Jobserver};

fn config(max_jobs: usize) -> EngineConfig {
    EngineConfig {
        max_jobs: NonZeroUsize::new(max_jobs).unwrap(),
        max_load: None,
        max_mem: None,
        continue_on_failure: false,
        continue_without_deps: false,
        gnu_make_enabled: false,
        status: None,
    }
}

#[test]
fn acquires_up_to_the_limit_then_blocks() {
    let js = Jobserver::new(&config(2)).expect("jobserver should build");

    let t1 = js.try_acquire().unwrap().expect("first token");
    let t2 = js.try_acquire().unwrap().expect("second token");
    assert_eq!(js.running_jobs(), 2);

    assert!(js.try_acquire().unwrap().is_none(), "pool should be exhausted at max_jobs");

    drop(t1);
    assert_eq!(js.running_jobs(), 1);

    let t3 = js.try_acquire().unwrap();
    assert!(t3.is_some(), "a released token should become acquirable again");

    drop(t2);
    drop(t3);
    assert_eq!(js.running_jobs(), 0);
}

#[test]
fn explicit_release_decrements_running_jobs() {
    let js = Jobserver::new(&config(1)).expect("jobserver should build");
    let token = js.try_acquire().unwrap().expect("token");
    assert_eq!(js.running_jobs(), 1);
    token.release().expect("release should succeed");
    assert_eq!(js.running_jobs(), 0);
}

#[tokio::test]
async fn wait_acquire_unblocks_once_a_token_is_released() {
    let js = Jobserver::new(&config(1)).expect("jobserver should build");
    let held = js.try_acquire().unwrap().expect("token");

    let waiter = {
        let js = js.clone();
        tokio::spawn(async move { js.wait_acquire().await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    drop(held);

    let token = waiter.await.unwrap().expect("wait_acquire should eventually succeed");
    assert_eq!(js.running_jobs(), 1);
    drop(token);
}

#[test]
fn make_args_empty_when_gnu_make_disabled() {
    let js = Jobserver::new(&config(4)).expect("jobserver should build");
    assert!(js.make_args().is_empty());
}
