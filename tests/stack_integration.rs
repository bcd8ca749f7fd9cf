use palisade::{
    Bulkhead, CircuitBreaker, Executor, HedgePolicy, InstantSleeper, PolicyError, RetryPolicy,
    Timeout,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError(&'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

#[tokio::test]
async fn retry_until_success() {
    let retry = RetryPolicy::builder()
        .max_attempts(3)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let successes = Arc::new(AtomicUsize::new(0));
    let successes_clone = successes.clone();
    let executor: Executor<&'static str, TestError> = Executor::builder()
        .push(retry)
        .on_success(move |summary| {
            successes_clone.fetch_add(1, Ordering::SeqCst);
            assert_eq!(summary.attempts, 3);
            assert_eq!(summary.executions, 3);
        })
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let result = executor
        .get(move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PolicyError::Inner(TestError("connection")))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(successes.load(Ordering::SeqCst), 1, "exactly one success event");
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_short_circuits() {
    let breaker: CircuitBreaker<u32, TestError> =
        CircuitBreaker::builder().failure_threshold(2).build().unwrap();
    let executor: Executor<u32, TestError> = Executor::builder().push(breaker.clone()).build();
    let executions = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let executions = executions.clone();
        let result = executor
            .get(move || {
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(PolicyError::Inner(TestError("down")))
                }
            })
            .await;
        assert_eq!(result.unwrap_err().as_inner(), Some(&TestError("down")));
    }

    let executions_clone = executions.clone();
    let third = executor
        .get(move || {
            let executions = executions_clone.clone();
            async move {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        })
        .await;

    assert!(third.unwrap_err().is_open());
    assert_eq!(executions.load(Ordering::SeqCst), 2, "third call never executed");
}

#[tokio::test(start_paused = true)]
async fn timeout_beats_a_slow_operation() {
    let timeout = Timeout::new(Duration::from_millis(100)).unwrap();
    let executor: Executor<u32, TestError> = Executor::builder().push(timeout).build();
    let op_token = Arc::new(std::sync::Mutex::new(None));
    let slot = op_token.clone();

    let started = tokio::time::Instant::now();
    let result = executor
        .get_with_execution(move |exec| {
            let slot = slot.clone();
            async move {
                *slot.lock().unwrap() = Some(exec.token().clone());
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(1)
            }
        })
        .await;

    assert!(result.unwrap_err().is_timeout());
    assert!(started.elapsed() <= Duration::from_millis(200));
    let token = op_token.lock().unwrap().take().expect("operation started");
    assert!(token.is_cancelled(), "operation context observes cancellation");
}

#[tokio::test(start_paused = true)]
async fn hedge_wins_when_the_primary_is_slow() {
    let hedge = HedgePolicy::builder()
        .delay(Duration::from_millis(80))
        .max_hedges(1)
        .build()
        .unwrap();
    let summary_slot = Arc::new(std::sync::Mutex::new(None));
    let summary_clone = summary_slot.clone();
    let executor: Executor<&'static str, TestError> = Executor::builder()
        .push(hedge)
        .on_done(move |summary| {
            *summary_clone.lock().unwrap() = Some(*summary);
        })
        .build();
    let lanes = Arc::new(AtomicUsize::new(0));
    let lanes_clone = lanes.clone();

    let started = tokio::time::Instant::now();
    let result = executor
        .get(move || {
            let lanes = lanes_clone.clone();
            async move {
                lanes.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok("foo")
            }
        })
        .await;

    assert_eq!(result.unwrap(), "foo");
    assert!(started.elapsed() <= Duration::from_millis(190), "hedge shortens the tail");
    assert_eq!(lanes.load(Ordering::SeqCst), 2, "exactly one hedge launched");

    let summary = summary_slot.lock().unwrap().take().expect("done fired");
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.executions, 1, "the cancelled loser does not count");
}

#[tokio::test]
async fn bulkhead_exhaustion_fails_fast() {
    let bulkhead = Bulkhead::new(2);
    let _one = bulkhead.try_acquire_permit().unwrap();
    let _two = bulkhead.try_acquire_permit().unwrap();

    let executor: Executor<u32, TestError> = Executor::builder().push(bulkhead.clone()).build();
    let result = executor.get(|| async { Ok(1) }).await;

    assert!(result.unwrap_err().is_full());
}

#[tokio::test]
async fn retry_around_an_open_breaker_never_executes() {
    let breaker: CircuitBreaker<u32, TestError> =
        CircuitBreaker::builder().failure_threshold(1).delay(Duration::from_secs(600)).build().unwrap();
    breaker.open();

    let retry = RetryPolicy::builder()
        .max_attempts(3)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let summary_slot = Arc::new(std::sync::Mutex::new(None));
    let summary_clone = summary_slot.clone();
    let executor: Executor<u32, TestError> = Executor::builder()
        .push(retry)
        .push(breaker)
        .on_done(move |summary| {
            *summary_clone.lock().unwrap() = Some(*summary);
        })
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let result = executor
        .get(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        })
        .await;

    match result.unwrap_err() {
        PolicyError::RetriesExceeded { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(last_error.expect("last failure captured").is_open());
        }
        e => panic!("expected RetriesExceeded wrapping Open, got {:?}", e),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0, "operation never invoked");

    let summary = summary_slot.lock().unwrap().take().expect("done fired");
    assert_eq!(summary.attempts, 3);
    assert_eq!(summary.executions, 0);
}

#[tokio::test]
async fn full_stack_happy_path() {
    let retry = RetryPolicy::builder()
        .max_attempts(3)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let breaker: CircuitBreaker<u32, TestError> =
        CircuitBreaker::builder().failure_threshold(5).build().unwrap();
    let bulkhead = Bulkhead::new(8);
    let timeout = Timeout::new(Duration::from_secs(2)).unwrap();

    let executor: Executor<u32, TestError> = Executor::builder()
        .push(retry)
        .push(breaker)
        .push(bulkhead)
        .push(timeout)
        .build();

    let result = executor.get(|| async { Ok(42) }).await;
    assert_eq!(result.unwrap(), 42);
}

#[tokio::test]
async fn outer_retry_recovers_from_an_inner_timeout() {
    let retry = RetryPolicy::builder()
        .max_attempts(2)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let timeout = Timeout::new(Duration::from_millis(50)).unwrap();
    let executor: Executor<u32, TestError> = Executor::builder().push(retry).push(timeout).build();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let result = executor
        .get(move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // First attempt stalls past the timeout; the retry's
                    // second attempt must run under a fresh timer.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(9)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 9);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn policy_errors_are_classifiable_by_outer_layers() {
    // An outer retry configured to abort on breaker rejections stops
    // immediately instead of burning attempts.
    let breaker: CircuitBreaker<u32, TestError> = CircuitBreaker::builder()
        .failure_threshold(1)
        .delay(Duration::from_secs(600))
        .build()
        .unwrap();
    breaker.open();

    let retry = RetryPolicy::builder()
        .max_attempts(5)
        .abort_error_if(|e| e.is_open())
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let done_attempts = Arc::new(AtomicUsize::new(0));
    let done_clone = done_attempts.clone();
    let executor: Executor<u32, TestError> = Executor::builder()
        .push(retry)
        .push(breaker)
        .on_done(move |summary| {
            done_clone.store(summary.attempts, Ordering::SeqCst);
        })
        .build();

    let result = executor.get(|| async { Ok(1) }).await;

    assert!(result.unwrap_err().is_open(), "abort surfaces the rejection unwrapped");
    assert_eq!(done_attempts.load(Ordering::SeqCst), 1, "abort stopped after one attempt");
}
