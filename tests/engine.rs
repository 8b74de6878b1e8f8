//! End-to-end engine behavior against a simulated STM32L051.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ihex::Record;
use tokio_util::sync::CancellationToken;

use plunger::error::Error;
use plunger::flashing::{self, DownloadOptions, FlashLoader, Format};
use plunger::ops;
use plunger::probe::fake_probe::{FakeProbe, FakeState};
use plunger::session::Session;
use plunger::target::TargetFamily;

const FLASH_BASE: u32 = 0x0800_0000;

fn l051_session() -> (Session, Arc<Mutex<FakeState>>) {
    let fake = FakeProbe::stm32l051();
    let state = fake.state();
    let family = TargetFamily::from_chip_name(Some("STM32L051K8"));
    let session = Session::attach_probe(fake, family).expect("attach failed");
    (session, state)
}

/// A four-record Intel HEX image covering 0x08000000..0x08000100.
fn hex_image() -> String {
    let mut records = vec![Record::ExtendedLinearAddress(0x0800)];
    for chunk in 0..4u16 {
        records.push(Record::Data {
            offset: chunk * 64,
            value: (chunk * 64..chunk * 64 + 64).map(|v| v as u8).collect(),
        });
    }
    records.push(Record::EndOfFile);
    ihex::create_object_file_representation(&records).unwrap()
}

#[test]
fn flash_hex_image_round_trip() {
    let (mut session, state) = l051_session();

    let mut loader = FlashLoader::new();
    flashing::load_hex(&mut loader, hex_image().as_bytes()).unwrap();
    flashing::download(&mut session, &loader, &DownloadOptions::default()).unwrap();

    let state = state.lock().unwrap();
    let expected: Vec<u8> = (0..=255).collect();
    assert_eq!(state.flash[..256], expected[..]);
    // Everything outside the image stays erased.
    assert!(state.flash[256..].iter().all(|b| *b == 0x00));
}

#[test]
fn flash_resumes_core_after_success() {
    let (mut session, _state) = l051_session();

    let mut loader = FlashLoader::new();
    loader.add_data(FLASH_BASE, &[0x12, 0x34, 0x56, 0x78]).unwrap();
    flashing::download(&mut session, &loader, &DownloadOptions::default()).unwrap();

    assert!(!session.core_halted().unwrap());
}

#[test]
fn flash_bin_lands_at_flash_base() {
    let (mut session, state) = l051_session();

    let mut loader = FlashLoader::new();
    flashing::load_image(&mut loader, &[0xAB, 0xCD], Format::Bin, FLASH_BASE).unwrap();
    flashing::download(&mut session, &loader, &DownloadOptions::default()).unwrap();

    assert_eq!(state.lock().unwrap().flash[..2], [0xAB, 0xCD]);
}

#[test]
fn flash_from_file_with_inferred_format() {
    let (mut session, state) = l051_session();

    let mut file = tempfile::Builder::new().suffix(".hex").tempfile().unwrap();
    file.write_all(hex_image().as_bytes()).unwrap();

    let format = Format::from_path(file.path()).unwrap();
    assert_eq!(format, Format::Hex);

    let data = std::fs::read(file.path()).unwrap();
    let mut loader = FlashLoader::new();
    flashing::load_image(&mut loader, &data, format, FLASH_BASE).unwrap();
    flashing::download(&mut session, &loader, &DownloadOptions::default()).unwrap();

    assert_eq!(state.lock().unwrap().flash[..256], (0..=255).collect::<Vec<u8>>()[..]);
}

#[test]
fn skip_erase_over_stale_data_fails_verification() {
    let (mut session, state) = l051_session();
    state.lock().unwrap().flash[..1024].fill(0xFF);

    let mut loader = FlashLoader::new();
    loader.add_data(FLASH_BASE, &[0x12; 64]).unwrap();

    let options = DownloadOptions {
        skip_erase: true,
        ..Default::default()
    };
    match flashing::download(&mut session, &loader, &options) {
        Err(Error::FlashVerifyFailed { address }) => assert_eq!(address, FLASH_BASE),
        other => panic!("expected FlashVerifyFailed, got {:?}", other),
    }
    // Verification failures leave the target halted.
    assert!(session.core_halted().unwrap());
}

#[test]
fn skip_erase_over_blank_flash_succeeds() {
    let (mut session, state) = l051_session();

    let mut loader = FlashLoader::new();
    loader.add_data(FLASH_BASE, &[0x12; 64]).unwrap();

    let options = DownloadOptions {
        skip_erase: true,
        ..Default::default()
    };
    flashing::download(&mut session, &loader, &options).unwrap();
    assert_eq!(state.lock().unwrap().flash[..64], [0x12; 64]);
}

#[test]
fn cancelled_download_leaves_target_halted() {
    let (mut session, state) = l051_session();

    let mut loader = FlashLoader::new();
    loader.add_data(FLASH_BASE, &[0x55; 64]).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = DownloadOptions {
        skip_erase: false,
        cancel,
    };

    match flashing::download(&mut session, &loader, &options) {
        Err(Error::Cancelled) => (),
        other => panic!("expected Cancelled, got {:?}", other),
    }
    assert!(session.core_halted().unwrap());
    // Nothing was written.
    assert!(state.lock().unwrap().flash[..64].iter().all(|b| *b == 0x00));
}

#[test]
fn cancelled_download_does_not_mass_erase() {
    let (mut session, state) = l051_session();
    // Existing firmware that a full download would erase.
    state.lock().unwrap().flash[..1024].fill(0xA5);

    let mut loader = FlashLoader::new();
    loader.add_data(FLASH_BASE, &[0x55; 64]).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = DownloadOptions {
        skip_erase: false,
        cancel,
    };

    match flashing::download(&mut session, &loader, &options) {
        Err(Error::Cancelled) => (),
        other => panic!("expected Cancelled, got {:?}", other),
    }
    assert!(state.lock().unwrap().flash[..1024].iter().all(|b| *b == 0xA5));
}

#[test]
fn oversized_image_is_rejected_before_erase() {
    let (mut session, state) = l051_session();
    state.lock().unwrap().flash[..1024].fill(0xA5);

    // A segment straddling the end of the 64 KiB flash.
    let mut loader = FlashLoader::new();
    loader
        .add_data(FLASH_BASE + 64 * 1024 - 32, &[0x12; 64])
        .unwrap();

    match flashing::download(&mut session, &loader, &DownloadOptions::default()) {
        Err(Error::ImageTooLarge { end, flash_end }) => {
            assert_eq!(end, FLASH_BASE + 64 * 1024 + 32);
            assert_eq!(flash_end, FLASH_BASE + 64 * 1024);
        }
        other => panic!("expected ImageTooLarge, got {:?}", other),
    }
    // Rejected before the chip was touched.
    assert!(state.lock().unwrap().flash[..1024].iter().all(|b| *b == 0xA5));
    assert!(!session.core_halted().unwrap());
}

#[test]
fn erase_blanks_prefilled_flash() {
    let (mut session, state) = l051_session();
    {
        let mut state = state.lock().unwrap();
        let len = state.flash.len();
        state.flash[..len].fill(0xA5);
    }

    ops::erase_with_session(&mut session, &CancellationToken::new()).unwrap();

    assert!(state.lock().unwrap().flash.iter().all(|b| *b == 0x00));
    assert!(!session.core_halted().unwrap());
}

#[test]
fn erase_is_idempotent() {
    let (mut session, _state) = l051_session();
    ops::erase_with_session(&mut session, &CancellationToken::new()).unwrap();
    ops::erase_with_session(&mut session, &CancellationToken::new()).unwrap();
}

#[test]
fn erase_times_out_on_stuck_controller() {
    let (mut session, state) = l051_session();
    state.lock().unwrap().stuck_busy = true;

    match ops::erase_with_session(&mut session, &CancellationToken::new()) {
        Err(Error::EraseTimeout) => (),
        other => panic!("expected EraseTimeout, got {:?}", other),
    }
}

#[test]
fn erase_refuses_protected_chip() {
    let (mut session, state) = l051_session();
    state.lock().unwrap().set_rdp(0xCC);

    match ops::erase_with_session(&mut session, &CancellationToken::new()) {
        Err(Error::TargetProtected) => (),
        other => panic!("expected TargetProtected, got {:?}", other),
    }
}

#[test]
fn cancelled_erase_leaves_flash_untouched() {
    let (mut session, state) = l051_session();
    state.lock().unwrap().flash[..1024].fill(0xA5);

    let cancel = CancellationToken::new();
    cancel.cancel();
    match ops::erase_with_session(&mut session, &cancel) {
        Err(Error::Cancelled) => (),
        other => panic!("expected Cancelled, got {:?}", other),
    }

    assert!(state.lock().unwrap().flash[..1024].iter().all(|b| *b == 0xA5));
    assert!(session.core_halted().unwrap());
}

#[test]
fn identify_reads_uid_and_flash_size() {
    let (mut session, _state) = l051_session();

    let identity = ops::identify_with_session(&mut session).unwrap();
    assert_eq!(identity.flash_size, Some(64 * 1024));

    let uid = identity.unique_id.expect("unique id missing");
    assert_eq!(uid.len(), 24);
    assert_eq!(uid, "778899003344556600110022");

    // The target runs again afterwards.
    assert!(!session.core_halted().unwrap());
}

#[test]
fn attach_rejects_foreign_core() {
    let fake = FakeProbe::stm32l051();
    fake.state().lock().unwrap().set_cpuid(0x410f_c241); // Cortex-M4

    let family = TargetFamily::from_chip_name(Some("STM32L051K8"));
    match Session::attach_probe(fake, family) {
        Err(Error::UnsupportedTarget(_)) => (),
        other => panic!("expected UnsupportedTarget, got {:?}", other),
    }
}

#[test]
fn halt_and_resume_track_core_state() {
    let (mut session, _state) = l051_session();

    session.halt_core(Duration::from_millis(100)).unwrap();
    assert!(session.core_halted().unwrap());

    session.resume_core().unwrap();
    assert!(!session.core_halted().unwrap());
}

#[test]
fn transient_timeouts_are_retried() {
    let (mut session, state) = l051_session();
    state.lock().unwrap().timeouts_remaining = 2;

    // Two timeouts fit within the retry budget.
    session.halt_core(Duration::from_millis(100)).unwrap();
    assert!(session.core_halted().unwrap());
}

#[test]
fn transport_fault_poisons_the_session() {
    let (mut session, state) = l051_session();
    state.lock().unwrap().fail_transport = true;

    assert!(matches!(
        session.read_word_32(0x2000_0000),
        Err(Error::Transport(_))
    ));

    // Even after the fault clears, the session stays unusable.
    state.lock().unwrap().fail_transport = false;
    assert!(matches!(
        session.read_word_32(0x2000_0000),
        Err(Error::Transport(_))
    ));
}

#[tokio::test]
async fn erase_target_reports_missing_probe() {
    let selector: plunger::DebugProbeSelector = "ffff:ffff".parse().unwrap();
    let cancel = CancellationToken::new();
    match ops::erase_target(selector, Some("STM32L051K8".into()), None, cancel).await {
        Err(Error::ProbeUnavailable) => (),
        other => panic!("expected ProbeUnavailable, got {:?}", other),
    }
}
