mod common;

use std::time::Duration;

use anyhow::Result;
use scroll::Endian;

use common::{MockTransport, OK, connect_response, loader, program_start_response, status_response};
use xcpflash::constants::commands;
use xcpflash::protect::SeedKey;

#[test]
fn read_data_sends_the_remainder_first() {
    let mock = MockTransport::connected(8, 9)
        .reply(OK)
        .reply(&[0xff, 1, 2, 3, 4])
        .reply(&[0xff, 5, 6, 7, 8, 9, 10, 11, 12])
        .reply(&[0xff, 13, 14, 15, 16, 17, 18, 19, 20]);
    let mut loader = loader(mock);
    loader.connect().unwrap();

    let mut buf = [0u8; 20];
    loader.read_data(0x0800_6000, &mut buf).unwrap();
    assert_eq!(buf.to_vec(), (1..=20).collect::<Vec<u8>>());

    let mock = loader.transport();
    let uploads: Vec<u8> = mock.sent(commands::UPLOAD).iter().map(|r| r[1]).collect();
    assert_eq!(uploads, vec![4, 8, 8]);
    assert_eq!(
        mock.sent(commands::SET_MTA)[0],
        &vec![commands::SET_MTA, 0, 0, 0, 0x00, 0x60, 0x00, 0x08]
    );
}

#[test]
fn program_data_uses_program_max_for_full_chunks() {
    let mock = MockTransport::connected(8, 8)
        .reply(&program_start_response(9))
        .reply(OK)
        .reply(OK)
        .reply(OK)
        .reply(OK);
    let mut loader = loader(mock);
    loader.connect().unwrap();
    loader.start_programming_session().unwrap();
    assert_eq!(loader.session().unwrap().max_prog_cto, 9);

    let data: Vec<u8> = (0..20).collect();
    let mut progress = vec![];
    loader
        .program_data_with_progress(0x1000, &data, |n| progress.push(n))
        .unwrap();
    assert_eq!(progress, vec![4, 8, 8]);

    let requests = &loader.transport().requests;
    let programs = &requests[requests.len() - 3..];
    assert_eq!(programs[0], vec![commands::PROGRAM, 4, 0, 1, 2, 3]);
    assert_eq!(programs[1][0], commands::PROGRAM_MAX);
    assert_eq!(&programs[1][1..], &data[4..12]);
    assert_eq!(programs[2][0], commands::PROGRAM_MAX);
    assert_eq!(&programs[2][1..], &data[12..20]);
}

#[test]
fn connect_retries_until_the_slave_answers() {
    let mock = MockTransport::new()
        .timeout()
        .timeout()
        .timeout()
        .timeout()
        .reply(&connect_response(8, 8, Endian::Little))
        .reply(&status_response(0));
    let mut loader = loader(mock);
    loader.connect().unwrap();
    assert!(loader.is_connected());

    let mock = loader.transport();
    assert_eq!(mock.sent(commands::CONNECT).len(), 5);
    assert!(mock.timeouts[..5].iter().all(|&t| t == Duration::from_millis(50)));
    assert_eq!(mock.connects, 1);
    assert_eq!(mock.disconnects, 0);
    assert_eq!(mock.sent(commands::GET_STATUS).len(), 1);
}

#[test]
fn connect_gives_up_after_five_attempts() {
    let mock = MockTransport::new()
        .timeout()
        .timeout()
        .timeout()
        .timeout()
        .timeout()
        .reply(&connect_response(8, 8, Endian::Little));
    let mut loader = loader(mock);
    assert!(loader.connect().is_err());
    assert!(!loader.is_connected());

    let mock = loader.into_transport();
    assert_eq!(mock.sent(commands::CONNECT).len(), 5);
    assert_eq!(mock.disconnects, 1);
    // The sixth answer was never asked for.
    assert_eq!(mock.replies.len(), 1);
}

#[test]
fn watchdog_is_serviced_on_every_connect_attempt() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let mock = MockTransport::new()
        .timeout()
        .timeout()
        .reply(&connect_response(8, 8, Endian::Little))
        .reply(&status_response(0));
    let mut loader = loader(mock).with_watchdog(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    loader.connect().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn program_reset_without_answer_is_success() {
    let mut loader = loader(MockTransport::connected(8, 8).timeout());
    loader.connect().unwrap();
    loader.disconnect().unwrap();
    assert!(!loader.is_connected());

    let mock = loader.transport();
    assert_eq!(mock.requests.last().unwrap(), &vec![commands::PROGRAM_RESET]);
    assert_eq!(mock.disconnects, 1);
}

#[test]
fn program_reset_rejection_is_an_error() {
    let mut loader = loader(MockTransport::connected(8, 8).reply(&[0xfe, 0x31]));
    loader.connect().unwrap();
    let err = loader.disconnect().unwrap_err();
    assert!(format!("{:#}", err).contains("0x31"));
    // The transport is closed either way.
    assert!(!loader.is_connected());
    assert_eq!(loader.transport().disconnects, 1);
}

#[test]
fn disconnect_when_not_connected_does_nothing() {
    let mut loader = loader(MockTransport::new());
    loader.disconnect().unwrap();
    assert!(loader.transport().requests.is_empty());
}

#[test]
fn stray_connect_response_is_drained() {
    let mock = MockTransport::new()
        .reply(&connect_response(8, 8, Endian::Little))
        .reply(&connect_response(8, 8, Endian::Little))
        .reply(&status_response(0));
    let mut loader = loader(mock);
    loader.connect().unwrap();

    let mock = loader.transport();
    assert_eq!(mock.requests.len(), 3);
    assert_eq!(mock.requests[1], vec![commands::GET_STATUS]);
    assert!(mock.requests[2].is_empty());
    assert_eq!(mock.timeouts[2], Duration::from_millis(50));
}

#[test]
fn big_endian_slave_gets_big_endian_fields() {
    let mock = MockTransport::new()
        .reply(&connect_response(8, 0x0102, Endian::Big))
        .reply(&status_response(0))
        .reply(OK)
        .reply(OK);
    let mut loader = loader(mock);
    assert!(loader.connect().is_err());

    let mock = MockTransport::new()
        .reply(&connect_response(8, 8, Endian::Big))
        .reply(&status_response(0))
        .reply(OK)
        .reply(OK);
    let mut loader = common::loader(mock);
    loader.connect().unwrap();
    assert_eq!(loader.session().unwrap().byte_order, Endian::Big);
    loader.clear_memory(0x0800_6000, 0x2000).unwrap();

    let requests = &loader.transport().requests;
    assert_eq!(requests[2], vec![commands::SET_MTA, 0, 0, 0, 0x08, 0x00, 0x60, 0x00]);
    assert_eq!(requests[3], vec![commands::PROGRAM_CLEAR, 0, 0, 0, 0x00, 0x00, 0x20, 0x00]);
    assert_eq!(loader.transport().timeouts[3], Duration::from_millis(10000));
}

#[test]
fn negative_response_fails_the_command() {
    let mock = MockTransport::connected(8, 8).reply(OK).reply(&[0xfe, 0x22]);
    let mut loader = loader(mock);
    loader.connect().unwrap();
    let err = loader.clear_memory(0x0, 0x100).unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains("PROGRAM_CLEAR"), "{}", msg);
    assert!(msg.contains("0x22"), "{}", msg);
}

#[test]
fn commands_need_a_session() {
    let mut loader = loader(MockTransport::new());
    let mut buf = [0u8; 4];
    assert!(loader.read_data(0, &mut buf).is_err());
    assert!(loader.program_data(0, &[1, 2]).is_err());
    assert!(loader.start_programming_session().is_err());
    assert!(loader.transport().requests.is_empty());
}

/// XORs the seed with 0x55.
struct XorSeedKey {
    privileges: u8,
}

impl SeedKey for XorSeedKey {
    fn available_privileges(&self) -> Result<u8> {
        Ok(self.privileges)
    }

    fn compute_key(&self, _resource: u8, seed: &[u8]) -> Result<Vec<u8>> {
        Ok(seed.iter().map(|b| b ^ 0x55).collect())
    }
}

#[test]
fn protected_slave_is_unlocked_with_seed_and_key() {
    // CTO 4 leaves two key bytes per UNLOCK, DTO 4 two seed bytes per GET_SEED.
    let mock = MockTransport::new()
        .reply(&connect_response(4, 4, Endian::Little))
        .reply(&status_response(0x10))
        .reply(&[0xff, 3, 0x10, 0x20])
        .reply(&[0xff, 1, 0x30])
        .reply(&[0xff, 0x10])
        .reply(&[0xff, 0x00]);
    let mut loader = loader(mock).with_seed_key(Box::new(XorSeedKey { privileges: 0x10 }));
    loader.connect().unwrap();

    let mock = loader.transport();
    assert_eq!(
        mock.sent(commands::GET_SEED),
        vec![&vec![commands::GET_SEED, 0, 0x10], &vec![commands::GET_SEED, 1, 0x10]]
    );
    assert_eq!(
        mock.sent(commands::UNLOCK),
        vec![&vec![commands::UNLOCK, 3, 0x45, 0x75], &vec![commands::UNLOCK, 1, 0x65]]
    );
}

#[test]
fn empty_seed_means_already_unlocked() {
    let mock = MockTransport::new()
        .reply(&connect_response(8, 8, Endian::Little))
        .reply(&status_response(0x10))
        .reply(&[0xff, 0, 0]);
    let mut loader = loader(mock).with_seed_key(Box::new(XorSeedKey { privileges: 0x10 }));
    loader.connect().unwrap();
    assert!(loader.transport().sent(commands::UNLOCK).is_empty());
}

#[test]
fn unlock_failures_close_the_session() {
    // Still protected after the key was accepted.
    let mock = MockTransport::new()
        .reply(&connect_response(8, 8, Endian::Little))
        .reply(&status_response(0x10))
        .reply(&[0xff, 1, 0x42])
        .reply(&[0xff, 0x10]);
    let mut loader = loader(mock).with_seed_key(Box::new(XorSeedKey { privileges: 0x10 }));
    assert!(loader.connect().is_err());
    assert!(!loader.is_connected());
    assert_eq!(loader.transport().disconnects, 1);

    // The algorithm cannot unlock programming.
    let mock = MockTransport::new()
        .reply(&connect_response(8, 8, Endian::Little))
        .reply(&status_response(0x10));
    let mut loader = common::loader(mock).with_seed_key(Box::new(XorSeedKey { privileges: 0x01 }));
    assert!(loader.connect().is_err());
    assert!(loader.transport().sent(commands::GET_SEED).is_empty());

    // No algorithm at all.
    let mock = MockTransport::new()
        .reply(&connect_response(8, 8, Endian::Little))
        .reply(&status_response(0x10));
    let mut loader = common::loader(mock);
    assert!(loader.connect().is_err());
}

#[test]
fn one_byte_cto_is_refused_at_connect() {
    let mut loader = loader(MockTransport::connected(1, 8));
    assert!(loader.connect().is_err());
    assert!(!loader.is_connected());
    assert!(loader.program_data(0x1000, &[1, 2, 3]).is_err());
    assert_eq!(loader.transport().sent(commands::PROGRAM).len(), 0);
}

#[test]
fn unlock_needs_room_for_key_bytes() {
    let mock = MockTransport::new()
        .reply(&connect_response(2, 8, Endian::Little))
        .reply(&status_response(0x10));
    let mut loader = loader(mock).with_seed_key(Box::new(XorSeedKey { privileges: 0x10 }));
    let err = loader.connect().unwrap_err();
    assert!(err.to_string().contains("UNLOCK"), "{}", err);
    assert!(loader.transport().sent(commands::GET_SEED).is_empty());
    assert!(!loader.is_connected());
}
