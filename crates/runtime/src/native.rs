//! Native (host) functions installed into every VM's global table (§6
//! "Native interface").

use rlox_core::Value;
use std::time::Instant;

/// Seconds elapsed since the interpreter process started, as an IEEE double.
pub fn clock(_args: &[Value]) -> Value {
    thread_local! {
        static START: Instant = Instant::now();
    }
    START.with(|start| Value::number(start.elapsed().as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_nonnegative_number() {
        let v = clock(&[]);
        assert!(v.is_number());
        assert!(v.as_number() >= 0.0);
    }
}
