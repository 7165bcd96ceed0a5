//! Process exit codes for ops runners.

use taskbridge_core::config::ConfigError;
use taskbridge_core::gateway::GatewayError;

pub const OK: i32 = 0;
/// Missing or invalid configuration.
pub const CONFIG: i32 = 64;
/// Unrecoverable external authentication failure.
pub const AUTH: i32 = 65;
/// Internal error.
pub const INTERNAL: i32 = 70;
/// Transient failure; retrying is appropriate.
pub const TRANSIENT: i32 = 75;

/// Maps an error chain onto the exit-code contract.
#[must_use]
pub fn code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return CONFIG;
        }
        if let Some(gateway) = cause.downcast_ref::<GatewayError>() {
            return match gateway {
                GatewayError::Unauthorized(_) => AUTH,
                GatewayError::RateLimited { .. } | GatewayError::Transient(_) => TRANSIENT,
                _ => INTERNAL,
            };
        }
    }
    INTERNAL
}
