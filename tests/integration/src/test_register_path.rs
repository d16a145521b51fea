// Licensed under the Apache-2.0 license

//! Register-path transfers against the card's RAM BAR.

#[cfg(test)]
mod test {
    use crate::common::*;
    use piecomm_driver::{CommandKind, Error, IoCmd, TransferCommand};
    use piecomm_emulator_periph::BAR0_LEN;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::{Duration, Instant};
    use zerocopy::IntoBytes;

    #[test]
    fn test_u8_and_u32_round_trip() {
        let rig = rig(test_config(), default_layout());
        let session = rig.session();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..256 {
            let offset = rng.gen_range(0..BAR0_LEN as u32 / 4) * 4;
            let value: u32 = rng.gen();
            session.write_u32(0, offset, value).unwrap();
            assert_eq!(session.read_u32(0, offset).unwrap(), value);

            let offset = rng.gen_range(0..BAR0_LEN as u32);
            let value: u8 = rng.gen();
            session.write_u8(0, offset, value).unwrap();
            assert_eq!(session.read_u8(0, offset).unwrap(), value);
        }
    }

    #[test]
    fn test_byte_writes_leave_neighbors_alone() {
        let rig = rig(test_config(), default_layout());
        let session = rig.session();
        session.write_u32(0, 0x200, 0x4433_2211).unwrap();
        session.write_u8(0, 0x201, 0xAB).unwrap();
        session.write_u8(0, 0x203, 0xCD).unwrap();
        assert_eq!(session.read_u32(0, 0x200).unwrap(), 0xCD33_AB11);
        assert_eq!(session.read_u8(0, 0x202).unwrap(), 0x33);
        assert_eq!(session.read_u32(0, 0x1FC).unwrap(), 0);
        assert_eq!(session.read_u32(0, 0x204).unwrap(), 0);
    }

    #[test]
    fn test_bulk_random_offset_round_trip() {
        const LEN: usize = 32768;
        let rig = rig(test_config(), default_layout());
        let session = rig.session();
        let data = random_bytes(0x5eed, LEN);
        let offset = StdRng::seed_from_u64(0x5eed).gen_range(0..=(BAR0_LEN - LEN)) as u32;

        let start = Instant::now();
        let cmd = IoCmd::new(&TransferCommand::register(0, offset), 0);
        assert_eq!(session.write(cmd.as_bytes(), &data).unwrap(), LEN);
        let mut back = vec![0u8; LEN];
        assert_eq!(session.read(cmd.as_bytes(), &mut back).unwrap(), LEN);
        assert!(start.elapsed() < Duration::from_secs(10));

        assert_eq!(back, data);
        let ram = rig.fpga.ram();
        assert_eq!(&ram[offset as usize..offset as usize + LEN], &data[..]);
    }

    #[test]
    fn test_wire_format_records() {
        let rig = rig(test_config(), default_layout());
        let session = rig.session();
        let data = [1u8, 2, 3, 4, 5, 6];

        let cmd = IoCmd::new(
            &TransferCommand::register(0, 0x40),
            data.as_ptr() as u64,
        );
        assert_eq!(session.write(cmd.as_bytes(), &data).unwrap(), 6);
        assert_eq!(&rig.fpga.ram()[0x40..0x46], &data);

        // The record names a different buffer than the one passed in.
        let mut back = [0u8; 6];
        assert!(matches!(
            session.read(cmd.as_bytes(), &mut back),
            Err(Error::BadCommand(_))
        ));

        let mut bytes = cmd.as_bytes().to_vec();
        bytes[0] = 7;
        assert!(matches!(
            session.read(&bytes, &mut back),
            Err(Error::BadCommand(_))
        ));
        assert!(matches!(
            session.read(&bytes[..IoCmd::SIZE - 1], &mut back),
            Err(Error::BadCommand(_))
        ));

        let cmd = IoCmd::new(&TransferCommand::register(0, 0x40), 0);
        assert_eq!(
            TransferCommand::try_from(&cmd).unwrap().kind,
            CommandKind::Register
        );
        session.read(cmd.as_bytes(), &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_bad_windows_touch_nothing() {
        let rig = rig(test_config(), default_layout());
        let session = rig.session();
        let mut buf = [0u8; 16];
        for window in [1u8, 3, 255] {
            assert!(matches!(
                session.read_cmd(&TransferCommand::register(window, 0), &mut buf),
                Err(Error::InvalidWindow { index }) if index == window
            ));
        }

        let before = rig.fpga.ram();
        let data = [0xEEu8; 16];
        assert!(matches!(
            session.write_cmd(
                &TransferCommand::register(0, BAR0_LEN as u32 - 8),
                &data
            ),
            Err(Error::OutOfRange { window: 0, .. })
        ));
        assert_eq!(rig.fpga.ram(), before);

        assert!(matches!(
            session.read_u32(0, 0x3),
            Err(Error::Misaligned { offset: 3 })
        ));
        assert!(matches!(
            session.write_u32(0, BAR0_LEN as u32, 0),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_register_bar2_scratch() {
        let rig = rig(test_config(), default_layout());
        let session = rig.session();
        let data = random_bytes(9, 0x100);
        session
            .write_cmd(&TransferCommand::register(2, 0x7000), &data)
            .unwrap();
        let mut back = vec![0u8; 0x100];
        session
            .read_cmd(&TransferCommand::register(2, 0x7000), &mut back)
            .unwrap();
        assert_eq!(back, data);
    }
}
