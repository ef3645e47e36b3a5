//! End to end flashing of the built-in PIC32CM JH01 description.

use algoflash::config::Registry;
use algoflash::fake::{FakeCore, Routine};
use algoflash::flashing::{
    self, AbortHandle, DownloadOptions, FailurePolicy, FlashError, FlashProgress, ProgressEvent,
};
use algoflash::Session;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

const DATA_FLASH: u64 = 0x40_0000;

fn setup() -> (Session, FakeCore) {
    // Set RUST_LOG to see the routine calls of a failing test.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let target = Registry::from_builtin_families()
        .unwrap()
        .get_target_by_name("PIC32CM5164JH01100")
        .unwrap();
    let core = FakeCore::new(&target);
    (Session::new(target, core.clone()), core)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

fn routines(core: &FakeCore, routine: Routine) -> usize {
    core.calls()
        .into_iter()
        .filter(|call| call.routine == routine)
        .count()
}

#[test]
fn program_and_verify_both_flash_arrays() {
    let (mut session, core) = setup();
    let main = pattern(0x900, 1);
    let data = pattern(0x80, 2);
    let options = DownloadOptions {
        verify: true,
        ..Default::default()
    };

    let report = flashing::program(
        &mut session,
        &[(DATA_FLASH, &data[..]), (0x0, &main[..])],
        &options,
    )
    .unwrap();

    let names = report
        .regions
        .iter()
        .map(|region| region.name.as_deref().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["main_flash", "data_flash"]);

    let main_report = &report.regions[0];
    assert_eq!(main_report.algorithm, "pic32cm_jh01_main");
    assert_eq!(main_report.sectors_erased, vec![0x0..0x8000]);
    assert_eq!(main_report.pages_programmed, 3);
    assert_eq!(main_report.bytes_written, 0xC00);
    assert_eq!(main_report.bytes_verified, 0xC00);

    let data_report = &report.regions[1];
    assert_eq!(data_report.sectors_erased, vec![DATA_FLASH..DATA_FLASH + 0x100]);
    assert_eq!(data_report.pages_programmed, 2);

    assert_eq!(core.read_memory(0x0, 0x900), main);
    assert_eq!(core.read_memory(DATA_FLASH, 0x80), data);

    // Neither algorithm ships the analyzer, both arrays are read back.
    assert_eq!(routines(&core, Routine::Analyzer), 0);
    assert!(!core.ram_was_written(0x2000_2000));
}

#[test]
fn init_receives_the_function_code_of_each_phase() {
    let (mut session, core) = setup();

    flashing::program(
        &mut session,
        &[(0x0, &[0x5A; 0x10][..])],
        &DownloadOptions {
            verify: true,
            ..Default::default()
        },
    )
    .unwrap();

    let phases = core
        .calls()
        .into_iter()
        .filter(|call| matches!(call.routine, Routine::Init | Routine::UnInit))
        .map(|call| match call.routine {
            Routine::Init => (call.routine, call.args[2]),
            _ => (call.routine, call.args[0]),
        })
        .collect::<Vec<_>>();

    assert_eq!(
        phases,
        vec![
            (Routine::Init, 1),
            (Routine::UnInit, 1),
            (Routine::Init, 2),
            (Routine::UnInit, 2),
            (Routine::Init, 3),
            (Routine::UnInit, 3),
        ]
    );
}

#[test]
fn verify_reports_the_first_differing_byte() {
    let (mut session, core) = setup();
    let main = pattern(0x800, 3);
    let data = pattern(0x40, 4);
    flashing::program(
        &mut session,
        &[(0x0, &main[..]), (DATA_FLASH, &data[..])],
        &DownloadOptions::default(),
    )
    .unwrap();

    core.preload(0x523, &[!main[0x523]]);
    core.preload(DATA_FLASH + 0x11, &[!data[0x11]]);

    // Main flash
    let failure = flashing::verify(&mut session, 0x0, &main, &DownloadOptions::default())
        .unwrap_err();
    assert!(matches!(
        failure.error(),
        FlashError::VerifyMismatch { address: 0x523 }
    ));
    assert_eq!(failure.address(), 0x523);

    // Data flash
    let failure = flashing::verify(&mut session, DATA_FLASH, &data, &DownloadOptions::default())
        .unwrap_err();
    assert_eq!(failure.address(), DATA_FLASH + 0x11);
    assert_eq!(failure.failure.region.as_deref(), Some("data_flash"));
}

#[test]
fn verify_of_partial_pages_compares_only_the_given_bytes() {
    let (mut session, core) = setup();
    core.preload(0x1000, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);

    let report =
        flashing::verify(&mut session, 0x1000, &[1, 2, 3, 4], &DownloadOptions::default())
            .unwrap();
    assert_eq!(report.regions[0].bytes_verified, 4);

    flashing::verify(
        &mut session,
        0x1000,
        &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
        &DownloadOptions::default(),
    )
    .unwrap();

    assert!(flashing::verify(&mut session, 0x1001, &[1], &DownloadOptions::default()).is_err());
}

#[test]
fn unchanged_sectors_are_skipped() {
    let (mut session, core) = setup();
    let image = pattern(0x800, 5);
    let options = DownloadOptions {
        skip_unchanged: true,
        ..Default::default()
    };

    flashing::program(&mut session, &[(0x0, &image[..])], &options).unwrap();

    core.clear_log();
    let report = flashing::program(&mut session, &[(0x0, &image[..])], &options).unwrap();

    assert_eq!(report.pages_skipped(), 2);
    assert_eq!(report.pages_programmed(), 0);
    assert_eq!(report.sectors_erased(), 0);
    assert_eq!(routines(&core, Routine::EraseSector), 0);
    assert_eq!(routines(&core, Routine::ProgramPage), 0);

    // One changed byte rewrites the whole sector.
    let mut changed = image.clone();
    changed[0x7FF] ^= 0xFF;
    core.clear_log();
    let report = flashing::program(&mut session, &[(0x0, &changed[..])], &options).unwrap();

    assert_eq!(report.pages_skipped(), 0);
    assert_eq!(report.pages_programmed(), 2);
    assert_eq!(report.sectors_erased(), 1);
    assert_eq!(core.read_memory(0x0, 0x800), changed);
}

#[test]
fn chip_erase_falls_back_to_sector_erase() {
    let (mut session, core) = setup();

    let report = flashing::program(
        &mut session,
        &[(0x8000, &[0x11; 0x400][..])],
        &DownloadOptions {
            do_chip_erase: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert!(!report.regions[0].chip_erased);
    assert_eq!(report.regions[0].sectors_erased, vec![0x8000..0x10000]);
    assert_eq!(routines(&core, Routine::EraseAll), 0);
}

#[test]
fn erase_all_erases_every_region_sector_by_sector() {
    let (mut session, core) = setup();
    core.preload(0x7_FFF0, &[0; 0x10]);
    core.preload(DATA_FLASH, &[0; 0x10]);

    let report = flashing::erase_all(&mut session, &DownloadOptions::default()).unwrap();

    assert_eq!(report.regions.len(), 2);
    assert_eq!(report.regions[0].sectors_erased.len(), 0x10);
    assert_eq!(report.regions[1].sectors_erased.len(), 0x20);
    assert_eq!(core.read_memory(0x7_FFF0, 0x10), vec![0xFF; 0x10]);
    assert_eq!(core.read_memory(DATA_FLASH, 0x10), vec![0xFF; 0x10]);
}

#[test]
fn unwritten_bytes_are_kept_on_request() {
    let (mut session, core) = setup();
    core.preload(0x1000, &[1, 2, 3, 4]);

    flashing::program(
        &mut session,
        &[(0x0, &[9; 4][..])],
        &DownloadOptions {
            keep_unwritten_bytes: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(core.read_memory(0x0, 4), vec![9; 4]);
    assert_eq!(core.read_memory(0x1000, 4), vec![1, 2, 3, 4]);

    flashing::program(
        &mut session,
        &[(0x0, &[8; 4][..])],
        &DownloadOptions::default(),
    )
    .unwrap();
    assert_eq!(core.read_memory(0x0, 4), vec![8; 4]);
    assert_eq!(core.read_memory(0x1000, 4), vec![0xFF; 4]);
}

#[test]
fn first_failure_stops_all_regions_by_default() {
    let (mut session, core) = setup();
    core.fail_call(Routine::ProgramPage, 1, 3);

    let failure = flashing::program(
        &mut session,
        &[(0x0, &[1; 0x400][..]), (DATA_FLASH, &[2; 0x40][..])],
        &DownloadOptions::default(),
    )
    .unwrap_err();

    assert_eq!(failure.failure.region.as_deref(), Some("main_flash"));
    assert_eq!(failure.report.regions.len(), 1);
    assert!(failure.other_failures.is_empty());
    assert_eq!(core.read_memory(DATA_FLASH, 1), vec![0xFF]);
}

#[test]
fn independent_regions_continue_after_a_failure() {
    let (mut session, core) = setup();
    core.fail_call(Routine::ProgramPage, 1, 3);

    let failure = flashing::program(
        &mut session,
        &[(0x0, &[1; 0x400][..]), (DATA_FLASH, &[2; 0x40][..])],
        &DownloadOptions {
            failure_policy: FailurePolicy::ContinueIndependent,
            ..Default::default()
        },
    )
    .unwrap_err();

    assert_eq!(failure.failure.region.as_deref(), Some("main_flash"));
    assert_eq!(failure.report.regions.len(), 2);
    assert_eq!(failure.report.regions[1].pages_programmed, 1);
    assert_eq!(core.read_memory(DATA_FLASH, 0x40), vec![2; 0x40]);
}

#[test]
fn aborted_operation_makes_no_calls() {
    let (mut session, core) = setup();
    let abort = AbortHandle::new();
    abort.abort();

    let failure = flashing::program(
        &mut session,
        &[(0x0, &[1; 0x10][..]), (DATA_FLASH, &[2; 0x10][..])],
        &DownloadOptions {
            abort,
            failure_policy: FailurePolicy::ContinueIndependent,
            ..Default::default()
        },
    )
    .unwrap_err();

    assert!(matches!(failure.error(), FlashError::Aborted));
    assert_eq!(failure.report.regions.len(), 1);
    assert!(core.calls().is_empty());
}

#[test]
fn abort_reports_the_page_where_work_stopped() {
    for disable_double_buffering in [true, false] {
        let (mut session, core) = setup();
        let abort = AbortHandle::new();
        let trigger = abort.clone();
        let progress = FlashProgress::new(move |event| {
            if let ProgressEvent::PageProgrammed { .. } = event {
                trigger.abort();
            }
        });

        let failure = flashing::program(
            &mut session,
            &[(0x0, &pattern(0xC00, 6)[..])],
            &DownloadOptions {
                abort,
                progress: Some(progress),
                disable_double_buffering,
                ..Default::default()
            },
        )
        .unwrap_err();

        assert!(matches!(failure.error(), FlashError::Aborted));
        assert_eq!(failure.address(), 0x400);
        assert_eq!(failure.report.regions[0].pages_programmed, 1);
        assert_eq!(routines(&core, Routine::ProgramPage), 1);
        // UnInit still closes the program phase.
        assert_eq!(
            core.calls().last().map(|call| call.routine),
            Some(Routine::UnInit)
        );
    }
}

#[test]
fn transport_failure_while_staging_reports_the_staged_page() {
    let (mut session, core) = setup();
    // The second page buffer.
    core.fail_memory_access(0x2000_04E0..0x2000_04E4);

    let failure = flashing::program(
        &mut session,
        &[(0x0, &pattern(0xC00, 7)[..])],
        &DownloadOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(failure.error(), FlashError::Transport(_)));
    assert_eq!(failure.address(), 0x400);
}

#[test]
fn data_past_the_end_of_the_address_space_is_rejected() {
    let (mut session, core) = setup();

    let failure = flashing::program(
        &mut session,
        &[(u64::MAX - 1, &[1, 2, 3][..])],
        &DownloadOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(failure.error(), FlashError::NoSuitableNvm { .. }));
    assert_eq!(failure.address(), u64::MAX - 1);

    let failure = flashing::verify(
        &mut session,
        u64::MAX - 1,
        &[1, 2, 3],
        &DownloadOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(failure.error(), FlashError::NoSuitableNvm { .. }));

    assert!(core.log().is_empty());
}

#[test]
fn hung_routine_forces_a_reload() {
    let (mut session, core) = setup();
    core.hang_call(Routine::EraseSector, 1);

    let failure = flashing::program(
        &mut session,
        &[(0x0, &[1; 0x10][..])],
        &DownloadOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        failure.error(),
        FlashError::ExecutionTimeout {
            routine: "erase_sector",
            address: Some(0),
            ..
        }
    ));
    assert!(failure.error().requires_reload());

    core.clear_log();
    flashing::program(
        &mut session,
        &[(0x0, &[1; 0x10][..])],
        &DownloadOptions::default(),
    )
    .unwrap();

    assert!(core.ram_was_written(0x2000_0000));
    assert_eq!(core.read_memory(0x0, 0x10), vec![1; 0x10]);
}

#[test]
fn transport_failure_is_reported_and_recovers() {
    let (mut session, core) = setup();
    core.fail_memory_access(0x2000_00E0..0x2000_00E4);

    let failure = flashing::program(
        &mut session,
        &[(0x0, &[1; 0x10][..])],
        &DownloadOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(failure.error(), FlashError::Transport(_)));

    core.clear_faults();
    flashing::program(
        &mut session,
        &[(0x0, &[1; 0x10][..])],
        &DownloadOptions::default(),
    )
    .unwrap();
}

#[test]
fn progress_events_follow_the_phases() {
    let (mut session, _core) = setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    let progress = FlashProgress::new(move |event| {
        let name = match event {
            ProgressEvent::Initialized { .. } => "initialized",
            ProgressEvent::StartedErasing => "started erasing",
            ProgressEvent::SectorErased { .. } => "sector erased",
            ProgressEvent::FinishedErasing => "finished erasing",
            ProgressEvent::StartedProgramming => "started programming",
            ProgressEvent::PageProgrammed { .. } => "page programmed",
            ProgressEvent::FinishedProgramming => "finished programming",
            ProgressEvent::StartedVerifying => "started verifying",
            ProgressEvent::FinishedVerifying { success: true } => "verified",
            _ => "unexpected",
        };
        recorded.lock().unwrap().push(name);
    });

    flashing::program(
        &mut session,
        &[(0x0, &[1; 0x800][..])],
        &DownloadOptions {
            progress: Some(progress),
            verify: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "initialized",
            "started erasing",
            "sector erased",
            "finished erasing",
            "started programming",
            "page programmed",
            "page programmed",
            "finished programming",
            "started verifying",
            "verified",
        ]
    );
}
