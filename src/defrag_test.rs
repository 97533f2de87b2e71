#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::string::String;
    use alloc::vec;
    use alloc::vec::Vec;

    use crate::add::DataSource;
    use crate::config::TfsConfig;
    use crate::defrag::{DefragOutcome, DefragState, Resume};
    use crate::device::{DeviceTable, TfsDevice};
    use crate::error::TfsError;
    use crate::file::OpenMode;
    use crate::flash::{FlashDevice, FlashError};
    use crate::header::FileFlags;
    use crate::platform::Platform;
    use crate::ramflash::RamFlash;
    use crate::tfs::Tfs;

    const SECTOR: u32 = 0x400;
    const LIMIT: u32 = 4 * SECTOR;

    /// Records are laid out back to back:
    /// f0 @0, f1 @400, f2 @1408, f3 @2000, f4 @2304, f5 @2800, f6 @2960.
    /// Once f0 is gone, f2's header lands across the sector 0/1 boundary.
    const FILES: [(&str, usize); 6] = [("f0", 300), ("f1", 916), ("f2", 500), ("f3", 200), ("f4", 400), ("f5", 60)];
    const LAST: (&str, usize) = ("f6", 600);

    /// Drops f0 and f3: the DSI sector ends up empty.
    const SHRINK: &[&str] = &["f0", "f3"];
    /// Drops f0 only: f6 still reaches into the DSI sector afterwards.
    const KEEP_TAIL: &[&str] = &["f0"];

    struct Declines;

    impl Platform for Declines {
        fn confirm(&mut self, _prompt: &str) -> bool {
            false
        }
    }

    fn table() -> DeviceTable {
        DeviceTable::new(vec![TfsDevice::new("//A/", 0, LIMIT - 1, LIMIT, SECTOR)])
    }

    fn context(flash: RamFlash) -> Tfs<RamFlash> {
        Tfs::new(flash, table(), TfsConfig::default()).expect("device table rejected")
    }

    fn mount(flash: RamFlash) -> Tfs<RamFlash> {
        let mut tfs = context(flash);
        tfs.mount().expect("mount failed");
        tfs
    }

    fn content(name: &str, len: usize) -> Vec<u8> {
        let seed = name.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
        (0..len).map(|i| seed.wrapping_add((i * 13) as u8)).collect()
    }

    /// Fill the device, delete `deleted`, then append f6.
    fn build(deleted: &[&str]) -> RamFlash {
        let mut tfs = mount(RamFlash::new(0, SECTOR, 5));
        for (name, len) in FILES {
            tfs.add(name, "", FileFlags::empty(), DataSource::Ram(&content(name, len)))
                .expect("add failed");
        }
        for name in deleted {
            tfs.unlink(name).expect("unlink failed");
        }
        let (name, len) = LAST;
        tfs.add(name, "", FileFlags::empty(), DataSource::Ram(&content(name, len)))
            .expect("add failed");
        tfs.into_flash()
    }

    /// Leave bytes behind in the DSI area, as an interrupted write would.
    fn dirty_dsi_area(flash: &mut RamFlash) {
        flash.program(LIMIT - 40, &[0x5A; 8]).expect("program failed");
    }

    fn expected(deleted: &[&str]) -> Vec<(String, Vec<u8>)> {
        FILES
            .iter()
            .chain(core::iter::once(&LAST))
            .filter(|(name, _)| !deleted.contains(name))
            .map(|&(name, len)| (String::from(name), content(name, len)))
            .collect()
    }

    fn read_all(tfs: &mut Tfs<RamFlash>, name: &str) -> Vec<u8> {
        let fd = tfs.open(name, OpenMode::READ).expect("open failed");
        let mut out = Vec::new();
        let mut buf = [0u8; 100];
        loop {
            match tfs.read(fd, &mut buf) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(TfsError::EndOfFile) => break,
                Err(e) => panic!("read of '{}' failed: {}", name, e),
            }
        }
        tfs.close(fd, None).expect("close failed");
        out
    }

    fn assert_files(tfs: &mut Tfs<RamFlash>, want: &[(String, Vec<u8>)]) {
        let names: Vec<String> = tfs.list(None).iter().map(|e| String::from(e.name())).collect();
        let want_names: Vec<String> = want.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, want_names);
        for (name, data) in want {
            assert_eq!(&read_all(tfs, name), data, "content of '{}'", name);
        }
    }

    fn spare_erased(tfs: &Tfs<RamFlash>) -> bool {
        tfs.flash().is_erased(LIMIT, LIMIT + SECTOR).expect("read failed")
    }

    fn power_lost(e: &TfsError) -> bool {
        matches!(
            e,
            TfsError::DefragFailed {
                cause: FlashError::PowerLoss,
                ..
            } | TfsError::FlashOperationFailed(FlashError::PowerLoss)
        )
    }

    /// Cut power at every flash operation of a defrag in turn. After each
    /// cut, reboot and mount, finish with an explicit defrag and compare the
    /// result with an uninterrupted run.
    fn power_cut_sweep(deleted: &[&str], dirty: bool) {
        let want = expected(deleted);
        let mut cut = 0;
        loop {
            let mut flash = build(deleted);
            if dirty {
                dirty_dsi_area(&mut flash);
            }
            let mut tfs = mount(flash);
            tfs.flash_mut().cut_power_after(cut);
            match tfs.defrag("//A/") {
                Ok(outcome) => {
                    assert!(matches!(outcome, DefragOutcome::Completed { .. }), "{:?}", outcome);
                    tfs.check_all().expect("check after full defrag failed");
                    assert_files(&mut tfs, &want);
                    assert!(spare_erased(&tfs));
                    break;
                }
                Err(e) => assert!(power_lost(&e), "cut {}: unexpected error {}", cut, e),
            }

            let mut tfs = mount(tfs.into_flash().reboot());
            tfs.defrag("//A/")
                .unwrap_or_else(|e| panic!("cut {}: defrag after reboot failed: {}", cut, e));
            tfs.check_all()
                .unwrap_or_else(|e| panic!("cut {}: check failed: {}", cut, e));
            assert_files(&mut tfs, &want);
            assert!(spare_erased(&tfs), "cut {}: spare left dirty", cut);
            assert_eq!(tfs.defrag("//A/"), Ok(DefragOutcome::NothingToDo));

            cut += 1;
            assert!(cut < 1000, "defrag never completed");
        }
    }

    /// Two devices of two sectors each behind one spare. B keeps data in
    /// its DSI sector after a pass, so the spare ends up holding B's DSI.
    fn shared_table() -> DeviceTable {
        DeviceTable::new(vec![
            TfsDevice::new("//A/", 0, 2 * SECTOR - 1, LIMIT, SECTOR),
            TfsDevice::new("//B/", 2 * SECTOR, LIMIT - 1, LIMIT, SECTOR),
        ])
    }

    fn shared_mount(flash: RamFlash) -> Tfs<RamFlash> {
        let mut tfs = Tfs::new(flash, shared_table(), TfsConfig::default()).expect("device table rejected");
        tfs.mount().expect("mount failed");
        tfs
    }

    const SHARED_FILES: [(&str, usize); 5] = [("a1", 200), ("a2", 900), ("//B/x", 300), ("//B/y", 900), ("//B/z", 200)];

    fn shared_build(dirty: bool) -> RamFlash {
        let mut tfs = shared_mount(RamFlash::new(0, SECTOR, 5));
        for (name, len) in SHARED_FILES {
            tfs.add(name, "", FileFlags::empty(), DataSource::Ram(&content(name, len)))
                .expect("add failed");
        }
        tfs.unlink("//B/x").expect("unlink failed");
        let mut flash = tfs.into_flash();
        if dirty {
            flash.program(LIMIT - 40, &[0x5A; 8]).expect("program failed");
        }
        flash
    }

    fn shared_sweep(dirty: bool) {
        let want: Vec<(String, Vec<u8>)> = SHARED_FILES
            .iter()
            .filter(|(name, _)| *name != "//B/x")
            .map(|&(name, len)| (String::from(name), content(name, len)))
            .collect();
        let mut cut = 0;
        loop {
            let mut tfs = shared_mount(shared_build(dirty));
            tfs.flash_mut().cut_power_after(cut);
            let done = match tfs.defrag("//B/") {
                Ok(outcome) => {
                    assert!(matches!(outcome, DefragOutcome::Completed { .. }), "{:?}", outcome);
                    true
                }
                Err(e) => {
                    assert!(power_lost(&e), "cut {}: unexpected error {}", cut, e);
                    false
                }
            };
            if !done {
                tfs = shared_mount(tfs.into_flash().reboot());
                tfs.defrag("//B/")
                    .unwrap_or_else(|e| panic!("cut {}: defrag after reboot failed: {}", cut, e));
            }
            tfs.check_all()
                .unwrap_or_else(|e| panic!("cut {}: check failed: {}", cut, e));
            assert_files(&mut tfs, &want);
            assert!(spare_erased(&tfs), "cut {}: spare left dirty", cut);
            assert_eq!(tfs.defrag("//A/"), Ok(DefragOutcome::NothingToDo), "cut {}", cut);
            assert_eq!(tfs.defrag("//B/"), Ok(DefragOutcome::NothingToDo), "cut {}", cut);
            if done {
                break;
            }
            cut += 1;
            assert!(cut < 1000, "defrag never completed");
        }
    }

    #[test]
    fn test_shared_spare_is_not_taken_for_another_device() {
        shared_sweep(false);
    }

    #[test]
    fn test_shared_spare_restage_stays_with_its_device() {
        shared_sweep(true);
    }

    #[test]
    fn test_defrag_packs_live_records() {
        let mut tfs = mount(build(SHRINK));
        let before = tfs.mem_usage(Some("//A/")).expect("usage failed");
        assert_eq!(before.dead_files, 2);

        let outcome = tfs.defrag("//A/").expect("defrag failed");
        assert_eq!(outcome, DefragOutcome::Completed { reclaimed: 400 + 304 });

        let addrs: Vec<u32> = tfs.list(None).iter().map(|e| e.addr).collect();
        assert_eq!(addrs, vec![0u32, 1008, 1600, 2096, 2256]);
        tfs.check("//A/").expect("check failed");
        assert_files(&mut tfs, &expected(SHRINK));

        let after = tfs.mem_usage(Some("//A/")).expect("usage failed");
        assert_eq!(after.dead_files, 0);
        assert_eq!(after.live_data, before.live_data);
        assert!(after.free > before.free);
        assert!(spare_erased(&tfs));
        assert_eq!(tfs.defrag("//A/"), Ok(DefragOutcome::NothingToDo));
    }

    #[test]
    fn test_open_reader_survives_defrag() {
        let mut tfs = mount(build(SHRINK));
        let fd = tfs.open("f4", OpenMode::READ).expect("open failed");
        let mut head = [0u8; 10];
        assert_eq!(tfs.read(fd, &mut head), Ok(10));

        tfs.defrag("//A/").expect("defrag failed");

        let mut rest = [0u8; 390];
        assert_eq!(tfs.read(fd, &mut rest), Ok(390));
        let want = content("f4", 400);
        assert_eq!(&head[..], &want[..10]);
        assert_eq!(&rest[..], &want[10..]);
        tfs.close(fd, None).expect("close failed");
    }

    #[test]
    fn test_power_cut_anywhere_when_tail_sector_empties() {
        power_cut_sweep(SHRINK, false);
    }

    #[test]
    fn test_power_cut_anywhere_when_tail_sector_keeps_data() {
        power_cut_sweep(KEEP_TAIL, false);
    }

    #[test]
    fn test_power_cut_anywhere_while_restaging() {
        power_cut_sweep(SHRINK, true);
    }

    #[test]
    fn test_status_follows_relocation() {
        let tfs = context(build(SHRINK));
        let idle = tfs.defrag_status("//A/").expect("status failed");
        assert_eq!(idle.state, DefragState::Inactive);
        assert!(idle.spare_erased);

        // 1. DSI written (2 programs), copy of sector 0 to the spare cut short.
        let mut tfs = mount(build(SHRINK));
        tfs.flash_mut().cut_power_after(2);
        assert!(tfs.defrag("//A/").is_err());
        let tfs = context(tfs.into_flash().reboot());
        let status = tfs.defrag_status("//A/").expect("status failed");
        assert_eq!(status.state, DefragState::Relocating(0));
        assert_eq!(status.resume, Some(Resume::CopyToSpare(0)));
        assert_eq!(status.first_touched, None);
        assert!(!status.spare_erased);

        // 2. Sector 0 copied (4 programs) and erased, refill cut short.
        let mut tfs = mount(build(SHRINK));
        tfs.flash_mut().cut_power_after(7);
        assert!(tfs.defrag("//A/").is_err());
        let mut tfs = context(tfs.into_flash().reboot());
        let status = tfs.defrag_status("//A/").expect("status failed");
        assert_eq!(status.state, DefragState::Relocating(0));
        assert_eq!(status.resume, Some(Resume::RefillFromSpare(0)));
        assert_eq!(status.first_touched, Some(0));
        assert_eq!(status.last_touched, Some(0));

        // 3. Mount picks it up from there.
        let report = tfs.mount().expect("mount failed");
        assert_eq!(
            report.recovered,
            vec![(String::from("//A/"), DefragOutcome::Resumed(Resume::RefillFromSpare(0)))]
        );
        assert_eq!(
            tfs.defrag_status("//A/").map(|s| s.state),
            Ok(DefragState::Inactive)
        );
        tfs.check_all().expect("check failed");
        assert_files(&mut tfs, &expected(SHRINK));
    }

    #[test]
    fn test_inconsistent_state_needs_the_operator() {
        let mut tfs = mount(build(SHRINK));
        tfs.flash_mut().cut_power_after(7);
        assert!(tfs.defrag("//A/").is_err());
        let mut flash = tfs.into_flash().reboot();
        // A sector the pass has not reached yet no longer matches the plan.
        flash.corrupt(2 * SECTOR + 100, 0x01);
        let image = flash.snapshot();

        let mut tfs = context(flash).with_platform(Box::new(Declines));
        let status = tfs.defrag_status("//A/").expect("status failed");
        assert_eq!(status.state, DefragState::AbortRestart);
        assert_eq!(status.resume, None);

        let report = tfs.mount().expect("mount failed");
        assert_eq!(report.recovered, vec![(String::from("//A/"), DefragOutcome::Aborted)]);
        assert!(report.restaged.is_empty());
        assert_eq!(tfs.flash().snapshot(), image);
    }

    #[test]
    fn test_interrupted_restage_is_repaired() {
        let mut flash = build(SHRINK);
        dirty_dsi_area(&mut flash);
        let mut tfs = mount(flash);
        // Restage: 3 programs to the spare, the owner tag, erase of the DSI
        // sector, then the copy back is cut short.
        tfs.flash_mut().cut_power_after(5);
        assert!(tfs.defrag("//A/").is_err());

        let mut tfs = context(tfs.into_flash().reboot());
        let status = tfs.defrag_status("//A/").expect("status failed");
        assert_eq!(status.state, DefragState::BuildingDsi);

        let report = tfs.mount().expect("mount failed");
        assert_eq!(report.restaged, vec![String::from("//A/")]);
        assert!(spare_erased(&tfs));
        tfs.check_all().expect("check failed");
        assert_files(&mut tfs, &expected(SHRINK));
    }

    #[test]
    fn test_defrag_refused_while_disabled() {
        let mut tfs = mount(build(SHRINK));
        tfs.set_script_running(true);
        assert_eq!(tfs.defrag("//A/"), Err(TfsError::CannotRunFromStartupScript));
        tfs.set_script_running(false);
        assert_eq!(tfs.defrag("//B/"), Err(TfsError::UnknownDevicePrefix));

        let cfg = TfsConfig {
            defrag_enabled: false,
            ..TfsConfig::default()
        };
        let mut tfs = Tfs::new(tfs.into_flash(), table(), cfg).expect("device table rejected");
        assert_eq!(tfs.defrag("//A/"), Err(TfsError::DefragDisabled));
    }
}
