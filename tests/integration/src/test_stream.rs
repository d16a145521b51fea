// Licensed under the Apache-2.0 license

//! Stream transfers through the ATT and the SGDMA engines.

#[cfg(test)]
mod test {
    use crate::common::*;
    use piecomm_config::DeviceConfig;
    use piecomm_driver::regs::AttEntryLow;
    use piecomm_driver::{DmaDirection, Error};
    use piecomm_emulator_periph::{BusLayout, WriteRecord};
    use tock_registers::LocalRegisterCopy;

    /// Small windows and a shallow ATT so one transfer wraps the table.
    fn small_windows() -> DeviceConfig {
        DeviceConfig {
            window_size: 0x4000,
            att_entries: 4,
            descriptor_fifo_depth: 2,
            ..test_config()
        }
    }

    fn loopback(rig: &Rig, len: usize, offset: usize, seed: u64) {
        let session = rig.session();
        let data = random_bytes(seed, len);
        assert_eq!(stream_write(&session, &data).unwrap(), len);

        let (mut storage, start) = page_buffer(len, offset);
        let buf = &mut storage[start..start + len];
        assert_eq!(stream_read(&session, buf).unwrap(), len);
        assert!(buf == &data[..], "looped back data differs");
    }

    fn assert_clean(rig: &Rig) {
        let stats = rig.fpga.stats();
        assert_eq!(stats.att_hazards, 0);
        assert_eq!(stats.overflows, 0);
        assert_eq!(stats.att_faults, 0);
        assert_eq!(stats.dma_faults, 0);
        let host = rig.host.stats();
        assert_eq!(host.pinned_now, 0);
        assert_eq!(host.unbalanced_unpins, 0);
        assert_eq!(host.maps, host.unmaps);
        assert_eq!(rig.host.mapped_ranges(), 0);
    }

    #[test]
    fn test_loopback_fidelity_across_pages_and_windows() {
        let rig = rig(small_windows(), default_layout());
        rig.fpga.set_loopback(true);
        loopback(&rig, 100 * 1024 + 123, 17, 1);
        assert!(rig.fpga.take_sink().is_empty());
        assert_clean(&rig);
    }

    #[test]
    fn test_loopback_with_latency() {
        let rig = rig(small_windows(), default_layout());
        rig.fpga.set_loopback(true);
        rig.fpga.set_latency(DmaDirection::ToDevice, 7);
        rig.fpga.set_latency(DmaDirection::FromDevice, 7);
        loopback(&rig, 64 * 1024, 0, 2);
        loopback(&rig, 3000, 4000, 3);
        assert_clean(&rig);
    }

    #[test]
    fn test_write_lands_in_sink() {
        let rig = rig(test_config(), default_layout());
        let session = rig.session();
        let data = random_bytes(4, 10_000);
        stream_write(&session, &data).unwrap();
        assert_eq!(rig.fpga.take_sink(), data);
        assert_clean(&rig);
    }

    #[test]
    fn test_coalesces_contiguous_pages() {
        let base = 0x1_0020_0000u64;
        let rig = rig(
            test_config(),
            BusLayout::Explicit(vec![base, base + 0x1000, base + 0x2000, base + 0x8000]),
        );
        let session = rig.session();
        rig.fpga.push_packet(&random_bytes(5, 4 * PAGE), false);
        let (mut storage, start) = page_buffer(4 * PAGE, 0);
        stream_read(&session, &mut storage[start..start + 4 * PAGE]).unwrap();

        let descriptors = rig.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].len, 3 * PAGE as u32);
        assert_eq!(descriptors[1].len, PAGE as u32);
        let completed = rig.fpga.completed();
        assert_eq!(completed[0].bus_address, base);
        assert_eq!(completed[1].bus_address, base + 0x8000);
        assert_eq!(
            &storage[start..start + 4 * PAGE],
            &random_bytes(5, 4 * PAGE)[..]
        );
        assert_clean(&rig);
    }

    #[test]
    fn test_merged_entries_split_at_window_boundary() {
        // Three pages straddling the 1 MiB boundary, merged into one entry
        // by the mapping layer.
        let rig = rig(
            test_config(),
            BusLayout::Contiguous {
                base: 0x1_000F_F000,
            },
        );
        rig.host.set_merge_adjacent(true);
        rig.fpga.set_loopback(true);
        let session = rig.session();
        let data = random_bytes(6, 3 * PAGE);
        let (mut storage, start) = page_buffer(3 * PAGE, 0);
        storage[start..start + 3 * PAGE].copy_from_slice(&data);
        stream_write(&session, &storage[start..start + 3 * PAGE]).unwrap();

        let completed = rig.fpga.completed();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].bus_address, 0x1_000F_F000);
        assert_eq!(completed[0].len, PAGE);
        assert_eq!(completed[1].bus_address, 0x1_0010_0000);
        assert_eq!(completed[1].len, 2 * PAGE);

        let mut back = vec![0u8; 3 * PAGE];
        stream_read(&session, &mut back).unwrap();
        assert_eq!(back, data);
        assert_clean(&rig);
    }

    #[test]
    fn test_att_wraparound_reuses_slots() {
        let config = DeviceConfig {
            window_size: 0x1000,
            att_entries: 2,
            descriptor_fifo_depth: 4,
            ..test_config()
        };
        let base = 0x2_0000_0000u64;
        let rig = rig(
            config,
            BusLayout::Strided {
                base,
                stride: 0x2000,
            },
        );
        rig.fpga.set_latency(DmaDirection::FromDevice, 5);
        let session = rig.session();
        let data = random_bytes(7, 6 * PAGE);
        rig.fpga.push_packet(&data, false);
        let (mut storage, start) = page_buffer(6 * PAGE, 0);
        stream_read(&session, &mut storage[start..start + 6 * PAGE]).unwrap();
        assert_eq!(&storage[start..start + 6 * PAGE], &data[..]);

        assert_eq!(rig.att_slots(), vec![0, 1, 0, 1, 0, 1]);
        let completed = rig.fpga.completed();
        assert_eq!(completed.len(), 6);
        for (i, transfer) in completed.iter().enumerate() {
            assert_eq!(transfer.bus_address, base + i as u64 * 0x2000);
            assert_eq!(transfer.avalon_address, (i as u32 % 2) * 0x1000);
        }
        // Slot 0's last row names page 4, not page 0.
        let (low, high) = rig.fpga.att_row(0);
        let expected = base + 4 * 0x2000;
        assert_eq!(low, expected as u32 | 1);
        assert_eq!(high, (expected >> 32) as u32);
        assert_clean(&rig);
    }

    #[test]
    fn test_fifo_backpressure() {
        let config = DeviceConfig {
            window_size: 0x1000,
            descriptor_fifo_depth: 2,
            ..test_config()
        };
        let rig = rig(
            config,
            BusLayout::Strided {
                base: 0x1_0000_0000,
                stride: 0x3000,
            },
        );
        rig.fpga.set_latency(DmaDirection::FromDevice, 20);
        rig.fpga.report_fifo_full(DmaDirection::FromDevice, 5);
        let session = rig.session();
        let data = random_bytes(8, 10 * PAGE);
        rig.fpga.push_packet(&data, false);
        let (mut storage, start) = page_buffer(10 * PAGE, 100);
        let buf = &mut storage[start..start + 10 * PAGE];
        stream_read(&session, buf).unwrap();
        assert!(buf == &data[..]);
        assert_eq!(rig.descriptors().len(), 11);
        assert_clean(&rig);
    }

    #[test]
    fn test_short_pin_releases_everything() {
        let rig = rig(test_config(), default_layout());
        rig.host.set_short_pin(Some(2));
        let session = rig.session();
        let (mut storage, start) = page_buffer(5 * PAGE, 0);
        assert!(matches!(
            stream_read(&session, &mut storage[start..start + 5 * PAGE]),
            Err(Error::ShortPin {
                pinned: 2,
                expected: 5
            })
        ));
        let stats = rig.host.stats();
        assert_eq!(stats.pins, 2);
        assert_eq!(stats.unpins, 2);
        assert_eq!(stats.maps, 0);
        assert!(rig.fpga.log().is_empty());
        assert!(!rig.device.needs_recovery());
        assert_clean(&rig);
    }

    #[test]
    fn test_only_reads_dirty_pages() {
        let rig = rig(test_config(), default_layout());
        rig.fpga.set_loopback(true);
        let session = rig.session();
        let (mut storage, start) = page_buffer(3 * PAGE, 0);
        stream_write(&session, &storage[start..start + 3 * PAGE]).unwrap();
        let stats = rig.host.stats();
        assert_eq!(stats.unpins, 3);
        assert_eq!(stats.dirty_unpins, 0);

        stream_read(&session, &mut storage[start..start + 3 * PAGE]).unwrap();
        let stats = rig.host.stats();
        assert_eq!(stats.unpins, 6);
        assert_eq!(stats.dirty_unpins, 3);
        assert_clean(&rig);
    }

    #[test]
    fn test_32bit_host() {
        let rig = rig(test_config(), BusLayout::Contiguous { base: 0x8000_0000 });
        rig.host.set_supports_64bit(false);
        rig.fpga.set_loopback(true);
        let session = rig.session();
        let data = random_bytes(10, 2 * PAGE);
        stream_write(&session, &data).unwrap();

        let log = rig.fpga.log();
        assert!(!log
            .iter()
            .any(|record| matches!(record, WriteRecord::AttHigh { .. })));
        let (low, _) = rig.fpga.att_row(0);
        let low = LocalRegisterCopy::<u32, AttEntryLow::Register>::new(low);
        assert!(low.matches_all(AttEntryLow::ADDRESS_SPACE::Bits32));
        assert_eq!(low.get() & !0xF_FFFF, 0x8000_0000);

        let mut back = vec![0u8; 2 * PAGE];
        stream_read(&session, &mut back).unwrap();
        assert_eq!(back, data);

        rig.host.set_layout(BusLayout::Contiguous {
            base: 0x1_0000_0000,
        });
        assert!(matches!(
            stream_write(&session, &data),
            Err(Error::AddressTooWide {
                bus_address: 0x1_0000_0000..
            })
        ));
        assert!(!rig.device.needs_recovery());
        assert_clean(&rig);
    }

    #[test]
    fn test_pulse_counter_source() {
        let rig = rig(test_config(), default_layout());
        rig.fpga.set_counter_source(true);
        let session = rig.session();
        let mut buf = vec![0u8; 2 * PAGE];
        stream_read(&session, &mut buf).unwrap();
        for (i, pair) in buf.chunks(2).enumerate() {
            assert_eq!(u16::from_be_bytes([pair[0], pair[1]]), i as u16);
        }
    }

    #[test]
    fn test_zero_length_and_missing_engine() {
        let config = DeviceConfig {
            tx_engine: None,
            ..test_config()
        };
        let rig = rig(config, default_layout());
        let session = rig.session();
        assert_eq!(stream_read(&session, &mut []).unwrap(), 0);
        assert!(matches!(
            stream_write(&session, &[1, 2, 3]),
            Err(Error::NoEngine)
        ));
        assert_eq!(rig.host.stats().pins, 0);
    }
}
