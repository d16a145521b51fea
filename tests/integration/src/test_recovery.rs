// Licensed under the Apache-2.0 license

//! Timeouts leave the device wedged until it is recovered.

#[cfg(test)]
mod test {
    use crate::common::*;
    use piecomm_config::DeviceConfig;
    use piecomm_driver::{
        CompletionSignal, DmaDirection, Error, OpenFlags, SignaledCompletion,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn impatient() -> DeviceConfig {
        DeviceConfig {
            fifo_timeout_ms: 50,
            completion_timeout_ms: 50,
            ..test_config()
        }
    }

    #[test]
    fn test_completion_timeout_needs_recovery() {
        let rig = rig(impatient(), default_layout());
        rig.fpga.set_stuck_busy(DmaDirection::FromDevice, true);
        rig.fpga.push_packet(&random_bytes(1, PAGE), false);
        let session = rig.session();

        let mut buf = vec![0u8; PAGE];
        let err = stream_read(&session, &mut buf).unwrap_err();
        assert!(matches!(err, Error::DeviceTimeout { .. }));
        assert!(err.is_timeout());
        assert!(rig.device.needs_recovery());
        assert_eq!(rig.host.stats().pinned_now, 0);
        assert_eq!(rig.host.mapped_ranges(), 0);

        // Stream transfers are refused without touching the host.
        let pins = rig.host.stats().pins;
        assert!(matches!(
            stream_read(&session, &mut buf),
            Err(Error::NeedsRecovery)
        ));
        assert_eq!(rig.host.stats().pins, pins);

        // Register access still works on a wedged device.
        session.write_u32(0, 0x10, 0x1234_5678).unwrap();
        assert_eq!(session.read_u32(0, 0x10).unwrap(), 0x1234_5678);

        rig.fpga.set_stuck_busy(DmaDirection::FromDevice, false);
        rig.device.recover().unwrap();
        assert!(!rig.device.needs_recovery());
        assert!(matches!(session.read_u32(0, 0x10), Err(Error::NotOpen)));
        assert!(matches!(session.close(), Err(Error::NotOpen)));

        let session = rig.session();
        let data = random_bytes(2, PAGE);
        rig.fpga.push_packet(&data, false);
        stream_read(&session, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_stalled_fifo_needs_recovery() {
        let rig = rig(impatient(), default_layout());
        rig.fpga.report_fifo_full(DmaDirection::FromDevice, u32::MAX);
        let session = rig.session();
        let mut buf = vec![0u8; PAGE];
        let err = stream_read(&session, &mut buf).unwrap_err();
        assert!(matches!(err, Error::FifoStalled { .. }));
        assert!(err.is_timeout());
        assert!(rig.descriptors().is_empty());
        assert!(rig.device.needs_recovery());
        assert_eq!(rig.host.stats().pinned_now, 0);

        rig.fpga.report_fifo_full(DmaDirection::FromDevice, 0);
        drop(session);
        rig.device.recover().unwrap();
        let session = rig.device.open(OpenFlags::NONBLOCK).unwrap();
        rig.fpga.push_packet(&random_bytes(3, PAGE), false);
        stream_read(&session, &mut buf).unwrap();
    }

    #[test]
    fn test_signaled_completion() {
        let mut rig = rig(test_config(), default_layout());
        let signal = Arc::new(CompletionSignal::new());
        rig.fpga.set_completion_signal(signal.clone());
        rig.device = rig.device.with_completion(Arc::new(SignaledCompletion::new(
            signal.clone(),
            Duration::from_millis(1),
        )));
        rig.fpga.set_loopback(true);
        rig.fpga.set_latency(DmaDirection::ToDevice, 3);
        rig.fpga.set_latency(DmaDirection::FromDevice, 3);

        let session = rig.session();
        let data = random_bytes(4, 5 * PAGE);
        stream_write(&session, &data).unwrap();
        let mut back = vec![0u8; 5 * PAGE];
        stream_read(&session, &mut back).unwrap();
        assert_eq!(back, data);
        assert!(signal.generation() >= 2);
    }

    #[test]
    fn test_signaled_completion_times_out() {
        let mut rig = rig(impatient(), default_layout());
        let signal = Arc::new(CompletionSignal::new());
        rig.fpga.set_completion_signal(signal.clone());
        rig.device = rig.device.with_completion(Arc::new(SignaledCompletion::new(
            signal,
            Duration::from_millis(5),
        )));
        rig.fpga.set_stuck_busy(DmaDirection::ToDevice, true);
        let session = rig.session();
        assert!(matches!(
            stream_write(&session, &random_bytes(5, 100)),
            Err(Error::DeviceTimeout { .. })
        ));
        assert!(rig.device.needs_recovery());
    }
}
