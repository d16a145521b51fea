// Licensed under the Apache-2.0 license

//! Sessions share one device lock.

#[cfg(test)]
mod test {
    use crate::common::*;
    use piecomm_driver::{Error, OpenFlags, TransferCommand};
    use piecomm_emulator_periph::WriteRecord;
    use poll_common::poll_until;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_nonblocking_open_sees_held_lock() {
        let rig = rig(test_config(), default_layout());
        let data = random_bytes(1, PAGE);
        thread::scope(|s| {
            let reader = s.spawn(|| {
                let session = rig.session();
                let mut buf = vec![0u8; PAGE];
                stream_read(&session, &mut buf).unwrap();
                buf
            });

            // The reader holds the lock until its descriptor gets data.
            poll_until(Duration::from_secs(2), Duration::from_millis(1), || {
                Ok(rig
                    .fpga
                    .log()
                    .iter()
                    .any(|r| matches!(r, WriteRecord::Descriptor { .. })))
            })
            .unwrap();
            let session = rig.device.open(OpenFlags::NONBLOCK).unwrap();
            assert!(matches!(session.read_u32(0, 0), Err(Error::WouldBlock)));

            rig.fpga.push_packet(&data, false);
            assert_eq!(reader.join().unwrap(), data);
            assert_eq!(session.read_u32(0, 0).unwrap(), 0);
        });
    }

    #[test]
    fn test_register_transfers_do_not_interleave() {
        const LEN: usize = 32 * 1024;
        let rig = rig(test_config(), default_layout());
        thread::scope(|s| {
            for pattern in [0xAAu8, 0x55] {
                let rig = &rig;
                s.spawn(move || {
                    let session = rig.session();
                    let data = vec![pattern; LEN];
                    for _ in 0..20 {
                        session
                            .write_cmd(&TransferCommand::register(0, 0), &data)
                            .unwrap();
                    }
                });
            }
            s.spawn(|| {
                let session = rig.session();
                let mut buf = vec![0u8; LEN];
                for _ in 0..40 {
                    session
                        .read_cmd(&TransferCommand::register(0, 0), &mut buf)
                        .unwrap();
                    assert!(buf.iter().all(|b| *b == buf[0]), "torn transfer");
                }
            });
        });
        let ram = rig.fpga.ram();
        assert!(ram[..LEN].iter().all(|b| *b == 0xAA) || ram[..LEN].iter().all(|b| *b == 0x55));
    }

    #[test]
    fn test_close_releases_binding() {
        let rig = rig(test_config(), default_layout());
        let first = rig.session();
        let second = rig.session();
        first.close().unwrap();
        second.write_u8(0, 7, 7).unwrap();
        second.close().unwrap();
        let third = rig.device.open(OpenFlags::NONBLOCK).unwrap();
        assert_eq!(third.read_u8(0, 7).unwrap(), 7);
        assert_eq!(third.flags(), OpenFlags::NONBLOCK);
    }
}
