//! Application and transaction middleware.
//!
//! Application middleware is installed in this order, outermost first:
//! [`logger`], [`errors`], [`metrics`], [`panics`], [`deadline`]. Route
//! middleware starts with [`begin_commit_rollback`] followed by the
//! authentication and authorization middleware from `auth::middleware`.

use crate::db::Beginner;
use crate::metrics::Metrics;
use crate::types::{AppError, ErrCode};
use crate::web::{handler, middleware, MidFunc};
use axum::response::IntoResponse;
use futures::FutureExt;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Logs the start and completion of every request.
///
/// The completion line carries the status actually written, including the
/// status of errors converted further in.
pub fn logger() -> MidFunc {
    middleware(|next| {
        handler(move |scope, req| {
            let next = next.clone();
            async move {
                let trace_id = scope.trace_id();
                let started = scope.started();
                let method = req.method().clone();
                let path = req.uri().path().to_string();
                let remote = req
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();

                info!(%trace_id, %method, %path, %remote, "request started");

                let result = next(scope, req).await;

                let status = match &result {
                    Ok(resp) => resp.status(),
                    Err(err) => err.code().http_status(),
                };
                info!(
                    %trace_id,
                    %method,
                    %path,
                    status = status.as_u16(),
                    since = ?started.elapsed(),
                    "request completed"
                );

                result
            }
        })
    })
}

/// Converts errors into wire responses after logging them in full.
///
/// Callers only ever see the code and the public message; detail hidden by
/// [`AppError::to_body`] stays in the log.
pub fn errors() -> MidFunc {
    middleware(|next| {
        handler(move |scope, req| {
            let next = next.clone();
            async move {
                let trace_id = scope.trace_id();
                match next(scope, req).await {
                    Ok(resp) => Ok(resp),
                    Err(err) => {
                        let code = err.code();
                        match code {
                            ErrCode::Internal | ErrCode::InternalOnlyLog | ErrCode::Unknown => {
                                error!(%trace_id, %code, message = %err, "handled error")
                            }
                            _ => warn!(%trace_id, %code, message = %err, "handled error"),
                        }
                        Ok(err.into_response())
                    }
                }
            }
        })
    })
}

/// Counts requests, errors and recovered panics.
pub fn metrics(m: Arc<Metrics>) -> MidFunc {
    middleware(move |next| {
        let m = m.clone();
        handler(move |scope, req| {
            let next = next.clone();
            let m = m.clone();
            async move {
                m.add_request();
                let result = next(scope, req).await;
                if let Err(err) = &result {
                    m.add_error();
                    if err.code() == ErrCode::InternalOnlyLog {
                        m.add_panic();
                    }
                }
                result
            }
        })
    })
}

/// Recovers a panic raised anywhere further in and turns it into an
/// `InternalOnlyLog` error. The panic message and a backtrace are logged.
pub fn panics() -> MidFunc {
    middleware(|next| {
        handler(move |scope, req| {
            let next = next.clone();
            async move {
                let trace_id = scope.trace_id();
                match AssertUnwindSafe(next(scope, req)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        let trace = Backtrace::force_capture();

                        error!(%trace_id, panic = %message, backtrace = %trace, "recovered panic");
                        Err(AppError::InternalOnlyLog(format!(
                            "PANIC [{}] TRACE[{}]",
                            message, trace
                        )))
                    }
                }
            }
        })
    })
}

/// Fails a request that runs longer than `limit` with `DeadlineExceeded`.
///
/// The unfinished chain is dropped, which rolls back any open transaction.
pub fn deadline(limit: Duration) -> MidFunc {
    middleware(move |next| {
        handler(move |scope, req| {
            let next = next.clone();
            async move {
                match tokio::time::timeout(limit, next(scope, req)).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::DeadlineExceeded(format!(
                        "request exceeded {:?}",
                        limit
                    ))),
                }
            }
        })
    })
}

/// Runs the rest of the chain inside a transaction: commit when it returns
/// `Ok`, roll back when it returns `Err`.
pub fn begin_commit_rollback(db: Arc<dyn Beginner>) -> MidFunc {
    middleware(move |next| {
        let db = db.clone();
        handler(move |mut scope, req| {
            let next = next.clone();
            let db = db.clone();
            async move {
                let trace_id = scope.trace_id();
                let tx = db.begin().await?;
                scope.set_transaction(tx.clone());

                match next(scope, req).await {
                    Ok(resp) => {
                        tx.commit()
                            .await
                            .map_err(|e| AppError::Internal(format!("commit tran: {}", e)))?;
                        Ok(resp)
                    }
                    Err(err) => {
                        if let Err(rb) = tx.rollback().await {
                            error!(%trace_id, error = %rb, "rollback failed");
                        }
                        Err(err)
                    }
                }
            }
        })
    })
}
