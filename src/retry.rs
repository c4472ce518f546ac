//! Bounded retry for conflict-prone mutations
//!
//! Writes against the declarative store can lose an optimistic-concurrency
//! race with a concurrent writer (a heartbeat patch racing the reconciler is
//! the canonical case). The combinator here retries a mutation a bounded
//! number of times, re-fetching the object before every attempt after the
//! first so each retry mutates fresh state. The bound is a deliberate
//! ceiling, not a contention estimate: exhausting it surfaces as a hard
//! failure rather than unbounded blocking.

use std::fmt::Display;
use std::future::Future;

use tracing::{error, warn};

/// Total attempts for device status writes, first try included
pub const STATUS_UPDATE_ATTEMPTS: u32 = 4;

/// Run a mutation with bounded retries and re-fetch-before-retry.
///
/// The first attempt consumes `seed` (the object the caller already read).
/// Every subsequent attempt re-fetches; a failed re-fetch consumes an
/// attempt like a failed mutation does. Returns the last error once
/// `max_attempts` is exhausted.
pub async fn retry_with_refetch<T, E, Rf, RFut, Op, OpFut>(
    max_attempts: u32,
    operation_name: &str,
    seed: T,
    mut refetch: Rf,
    mut operation: Op,
) -> Result<(), E>
where
    Rf: FnMut() -> RFut,
    RFut: Future<Output = Result<T, E>>,
    Op: FnMut(T) -> OpFut,
    OpFut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut attempt = 0u32;
    let mut current = Some(seed);

    loop {
        attempt += 1;

        let object = match current.take() {
            Some(object) => object,
            None => match refetch().await {
                Ok(object) => object,
                Err(e) => {
                    if attempt >= max_attempts {
                        error!(
                            operation = %operation_name,
                            attempt,
                            error = %e,
                            "refetch failed on final attempt"
                        );
                        return Err(e);
                    }
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "refetch failed, retrying"
                    );
                    continue;
                }
            },
        };

        match operation(object).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "mutation failed after max attempts"
                    );
                    return Err(e);
                }
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "mutation failed, retrying after refetch"
                );
            }
        }
    }
}
