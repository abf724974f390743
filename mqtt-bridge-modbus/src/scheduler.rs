//! Poll scheduling of read datapoints.
//!
//! Times are milliseconds of a monotonic clock truncated to 32 bits. A due
//! time is compared with signed-difference semantics, so a clock that wraps
//! past `u32::MAX` keeps polling on schedule.

use crate::model::{Datapoint, Device};

/// Whether a datapoint should be read at `now_ms`.
pub fn is_due(dp: &Datapoint, now_ms: u32) -> bool {
    if !dp.function.is_read() {
        return false;
    }
    dp.poll_interval_ms == 0 || dp.next_due_at_ms == 0 || reached(now_ms, dp.next_due_at_ms)
}

fn reached(now_ms: u32, due_ms: u32) -> bool {
    now_ms.wrapping_sub(due_ms) as i32 >= 0
}

/// Record when a datapoint is due next after a read at `now_ms`.
pub fn schedule_next(dp: &mut Datapoint, now_ms: u32) {
    dp.next_due_at_ms = if dp.poll_interval_ms > 0 {
        now_ms.wrapping_add(dp.poll_interval_ms)
    } else {
        0
    };
}

/// Append the indices of the due read datapoints of `device` to `out`.
///
/// Indices come in configuration order. Returns the length of `out`.
pub fn collect_due_read_datapoints(device: &Device, now_ms: u32, out: &mut Vec<usize>) -> usize {
    out.extend(
        device
            .datapoints
            .iter()
            .enumerate()
            .filter(|(_, dp)| is_due(dp, now_ms))
            .map(|(index, _)| index),
    );
    out.len()
}

pub fn has_due_read_datapoints(device: &Device, now_ms: u32) -> bool {
    device.datapoints.iter().any(|dp| is_due(dp, now_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FunctionCode;

    fn dp(function: FunctionCode, interval: u32) -> Datapoint {
        Datapoint {
            function,
            poll_interval_ms: interval,
            ..Datapoint::default()
        }
    }

    #[test]
    fn test_writes_never_due() {
        for function in [
            FunctionCode::WriteCoil,
            FunctionCode::WriteHolding,
            FunctionCode::WriteMultipleHolding,
        ] {
            assert!(!is_due(&dp(function, 0), 12345));
        }
    }

    #[test]
    fn test_zero_interval_always_due() {
        let mut point = dp(FunctionCode::ReadInput, 0);
        assert!(is_due(&point, 0));
        schedule_next(&mut point, 5000);
        assert_eq!(point.next_due_at_ms, 0);
        assert!(is_due(&point, 5001));
    }

    #[test]
    fn test_interval_schedule() {
        let mut point = dp(FunctionCode::ReadHolding, 1000);
        assert!(is_due(&point, 1));

        schedule_next(&mut point, 1000);
        assert_eq!(point.next_due_at_ms, 2000);
        assert!(!is_due(&point, 1999));
        assert!(is_due(&point, 2000));
        assert!(is_due(&point, 2500));
    }

    #[test]
    fn test_schedule_across_wrap() {
        let mut point = dp(FunctionCode::ReadCoil, 100);
        let now = u32::MAX - 10;

        schedule_next(&mut point, now);
        assert_eq!(point.next_due_at_ms, 89);
        assert!(!is_due(&point, u32::MAX));
        assert!(!is_due(&point, 50));
        assert!(is_due(&point, 89));
    }

    #[test]
    fn test_collect_keeps_order_and_skips_writes() {
        let mut device = Device::new("boiler", "Boiler", 3);
        device.datapoints = vec![
            dp(FunctionCode::ReadHolding, 0),
            dp(FunctionCode::WriteHolding, 0),
            dp(FunctionCode::ReadCoil, 500),
            dp(FunctionCode::ReadInput, 0),
        ];
        schedule_next(&mut device.datapoints[2], 1000);

        let mut due = Vec::new();
        assert_eq!(collect_due_read_datapoints(&device, 1200, &mut due), 2);
        assert_eq!(due, vec![0, 3]);

        due.clear();
        collect_due_read_datapoints(&device, 1500, &mut due);
        assert_eq!(due, vec![0, 2, 3]);

        for index in &due {
            assert!(device.datapoints[*index].function.is_read());
        }
    }

    #[test]
    fn test_has_due() {
        let mut device = Device::new("meter", "Meter", 1);
        device.datapoints = vec![dp(FunctionCode::WriteCoil, 0)];
        assert!(!has_due_read_datapoints(&device, 0));

        device.datapoints.push(dp(FunctionCode::ReadDiscrete, 250));
        schedule_next(&mut device.datapoints[1], 0);
        assert!(!has_due_read_datapoints(&device, 100));
        assert!(has_due_read_datapoints(&device, 250));
    }
}
