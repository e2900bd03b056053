//! Small runtime helpers shared by both server roles.

use std::time::Duration;

use rand::Rng;

/// Sleep for roughly `seconds`, +/-10%. Timers that many peers arm from the
/// same trigger would otherwise fire in lockstep.
pub async fn delay_jittered(seconds: f64) {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    tokio::time::sleep(Duration::from_secs_f64((seconds * factor).max(0.0))).await;
}

/// Plain sleep for knob-valued intervals.
pub async fn delay(seconds: f64) {
    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
}
