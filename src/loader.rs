//! XCP loader: the master side of a firmware update session.
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use scroll::Endian;

use crate::constants::{CONNECT_RETRIES, MAX_PACKET_SIZE, resource};
use crate::protect::{SeedKey, SeedKeyLibrary};
use crate::protocol::{Command, ConnectInfo, Response};
use crate::target::Watchdog;
use crate::transport::{self, Transport};

/// Total length of a CONNECT response, PID included.
const CONNECT_RESPONSE_LEN: usize = 1 + ConnectInfo::PAYLOAD_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderSettings {
    /// Generic command timeout.
    pub t1: Duration,
    /// PROGRAM_START timeout.
    pub t3: Duration,
    /// PROGRAM_CLEAR (erase) timeout.
    pub t4: Duration,
    /// PROGRAM, PROGRAM_MAX and PROGRAM_RESET timeout.
    pub t5: Duration,
    /// CONNECT timeout, per attempt.
    pub t6: Duration,
    /// Busy wait timeout.
    pub t7: Duration,
    pub connect_mode: u8,
    /// Shared library with the seed/key algorithm, if the slave protects programming.
    pub seed_key_library: Option<PathBuf>,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        LoaderSettings {
            t1: Duration::from_millis(1000),
            t3: Duration::from_millis(2000),
            t4: Duration::from_millis(10000),
            t5: Duration::from_millis(1000),
            t6: Duration::from_millis(50),
            t7: Duration::from_millis(2000),
            connect_mode: 0,
            seed_key_library: None,
        }
    }
}

/// Parameters of the current session, negotiated with the slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub byte_order: Endian,
    pub max_cto: u8,
    /// CTO size during the programming session, refined by PROGRAM_START.
    pub max_prog_cto: u8,
    pub max_dto: u16,
}

/// Sizes of the transfers needed to move `len` bytes in units of `unit` bytes.
///
/// The first chunk takes the remainder so that every following chunk is a full unit:
/// 20 bytes in units of 8 go as 4, 8, 8.
pub fn remainder_first(len: usize, unit: usize) -> impl Iterator<Item = usize> {
    assert!(unit > 0, "chunk unit must not be zero");
    let mut remaining = len;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let cnt = match remaining % unit {
            0 => unit,
            rem => rem,
        };
        remaining -= cnt;
        Some(cnt)
    })
}

pub struct XcpLoader<T: Transport> {
    transport: T,
    settings: LoaderSettings,
    session: Option<Session>,
    seed_key: Option<Box<dyn SeedKey>>,
    watchdog: Box<dyn Watchdog>,
}

impl<T: Transport> XcpLoader<T> {
    pub fn new(transport: T, settings: LoaderSettings) -> Self {
        XcpLoader {
            transport,
            settings,
            session: None,
            seed_key: None,
            watchdog: Box::new(|| {}),
        }
    }

    /// Use `seed_key` instead of loading the library named in the settings.
    pub fn with_seed_key(mut self, seed_key: Box<dyn SeedKey>) -> Self {
        self.seed_key = Some(seed_key);
        self
    }

    /// Hook serviced on every CONNECT attempt.
    pub fn with_watchdog(mut self, watchdog: impl Watchdog + 'static) -> Self {
        self.watchdog = Box::new(watchdog);
        self
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn active_session(&self) -> Result<Session> {
        self.session
            .ok_or_else(|| anyhow::format_err!("not connected to the bootloader"))
    }

    fn byte_order(&self) -> Endian {
        self.session.map(|s| s.byte_order).unwrap_or(Endian::Little)
    }

    /// Connect to the slave and unlock programming if it is protected.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            if let Err(e) = self.disconnect() {
                log::warn!("Closing the previous session failed: {}", e);
            }
        }
        self.transport.connect()?;

        let mut info = None;
        for attempt in 1..=CONNECT_RETRIES {
            self.watchdog.service();
            match self.send_connect() {
                Ok(i) => {
                    info = Some(i);
                    break;
                }
                Err(e) => log::debug!("CONNECT attempt {}/{}: {}", attempt, CONNECT_RETRIES, e),
            }
        }
        let Some(info) = info else {
            self.transport.disconnect();
            anyhow::bail!("no response to CONNECT after {} attempts", CONNECT_RETRIES);
        };

        let session = match Self::negotiate(&info) {
            Ok(session) => session,
            Err(e) => {
                self.transport.disconnect();
                return Err(e);
            }
        };
        log::info!(
            "Connected: {} endian, CTO {} bytes, DTO {} bytes",
            if session.byte_order == Endian::Little { "little" } else { "big" },
            session.max_cto,
            session.max_dto
        );
        self.session = Some(session);

        if let Err(e) = self.unlock_programming() {
            self.close_transport();
            return Err(e);
        }
        Ok(())
    }

    fn negotiate(info: &ConnectInfo) -> Result<Session> {
        anyhow::ensure!(
            info.max_cto >= 2 && info.max_dto > 0,
            "slave announced an unusable packet size (CTO {}, DTO {})",
            info.max_cto,
            info.max_dto
        );
        anyhow::ensure!(
            usize::from(info.max_dto) <= MAX_PACKET_SIZE,
            "slave DTO size {} exceeds the packet buffer of {} bytes",
            info.max_dto,
            MAX_PACKET_SIZE
        );
        Ok(Session {
            byte_order: info.byte_order(),
            max_cto: info.max_cto,
            max_prog_cto: info.max_cto,
            max_dto: info.max_dto,
        })
    }

    /// End the session with PROGRAM_RESET, which starts the user program if there is one,
    /// and close the transport.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let result = self.program_reset();
        self.close_transport();
        result
    }

    /// Close the transport without resetting the slave.
    pub fn abort(&mut self) {
        self.close_transport();
    }

    fn close_transport(&mut self) {
        self.transport.disconnect();
        self.session = None;
    }

    /// Enter the programming session.
    pub fn start_programming_session(&mut self) -> Result<()> {
        let mut session = self.active_session()?;
        let payload = self.execute(Command::ProgramStart, self.settings.t3, 7..=7)?;
        // RESERVED, COMM_MODE_PGM, MAX_CTO_PGM, MAX_BS_PGM, MIN_ST_PGM, QUEUE_SIZE_PGM
        let max_prog_cto = payload[2];
        anyhow::ensure!(
            max_prog_cto >= 2,
            "slave announced a programming CTO of {} bytes",
            max_prog_cto
        );
        session.max_prog_cto = max_prog_cto;
        self.session = Some(session);
        log::debug!("Programming session started, CTO {} bytes", max_prog_cto);
        Ok(())
    }

    /// Mark the end of programming with an empty PROGRAM command.
    pub fn stop_programming_session(&mut self) -> Result<()> {
        self.active_session()?;
        self.execute(Command::program(&[]), self.settings.t5, 1..=1)?;
        log::debug!("Programming session stopped");
        Ok(())
    }

    /// Erase `len` bytes starting at `address`.
    pub fn clear_memory(&mut self, address: u32, len: u32) -> Result<()> {
        anyhow::ensure!(len > 0, "nothing to erase");
        self.active_session()?;
        self.set_mta(address)?;
        self.execute(Command::program_clear(len), self.settings.t4, 1..=1)?;
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `address`.
    pub fn read_data(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        anyhow::ensure!(!buf.is_empty(), "nothing to read");
        let session = self.active_session()?;
        anyhow::ensure!(session.max_dto >= 2, "DTO too small for UPLOAD");
        let unit = usize::from(session.max_dto) - 1;

        self.set_mta(address)?;
        let mut offset = 0;
        for cnt in remainder_first(buf.len(), unit) {
            let cmd = Command::upload(cnt as u8);
            let payload = self.execute(cmd, self.settings.t1, cnt + 1..=cnt + 1)?;
            buf[offset..offset + cnt].copy_from_slice(&payload);
            offset += cnt;
        }
        Ok(())
    }

    /// Program `data` starting at `address`. The memory must have been erased before.
    pub fn program_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.program_data_with_progress(address, data, |_| {})
    }

    /// Like [`Self::program_data`], calling `progress` with the size of every chunk sent.
    pub fn program_data_with_progress<F>(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(usize),
    {
        anyhow::ensure!(!data.is_empty(), "nothing to program");
        let session = self.active_session()?;
        let unit = usize::from(session.max_prog_cto) - 1;

        self.set_mta(address)?;
        let mut offset = 0;
        for cnt in remainder_first(data.len(), unit) {
            let chunk = &data[offset..offset + cnt];
            let cmd = if cnt < unit {
                Command::program(chunk)
            } else {
                Command::program_max(chunk)
            };
            self.execute(cmd, self.settings.t5, 1..=1)?;
            offset += cnt;
            progress(cnt);
        }
        Ok(())
    }

    fn set_mta(&mut self, address: u32) -> Result<()> {
        self.execute(Command::set_mta(address), self.settings.t1, 1..=1)?;
        Ok(())
    }

    fn send_connect(&mut self) -> Result<ConnectInfo> {
        let cmd = Command::connect(self.settings.connect_mode);
        let expected = CONNECT_RESPONSE_LEN..=CONNECT_RESPONSE_LEN;
        let payload = self.execute(cmd, self.settings.t6, expected)?;
        ConnectInfo::parse(&payload)
    }

    /// PROGRAM_RESET. The slave may reset before it answers, so no response is fine.
    fn program_reset(&mut self) -> Result<()> {
        let order = self.byte_order();
        match self
            .transport
            .transfer(Command::ProgramReset, order, self.settings.t5)
        {
            Ok(resp) => {
                positive("PROGRAM_RESET", resp, 1..=1)?;
            }
            Err(e) if transport::is_timeout(&e) => {
                log::debug!("No response to PROGRAM_RESET, slave is resetting");
            }
            Err(e) => return Err(e.context("PROGRAM_RESET failed")),
        }
        log::info!("Device reset");
        Ok(())
    }

    /// GET_STATUS, returning the resource protection mask.
    fn get_status(&mut self) -> Result<u8> {
        let order = self.byte_order();
        let mut resp = self
            .transport
            .transfer(Command::GetStatus, order, self.settings.t1)
            .context("GET_STATUS failed")?;
        // A duplicate CONNECT response may still be queued ahead of ours.
        if resp.is_ok() && resp.packet_len() == CONNECT_RESPONSE_LEN {
            log::debug!("Dropping stray CONNECT response");
            let raw = self
                .transport
                .send_packet(&[], self.settings.t6)
                .context("GET_STATUS failed")?;
            log::debug!("<= {}", hex::encode(&raw));
            resp = Response::from_raw(&raw)?;
        }
        let payload = positive("GET_STATUS", resp, 6..=6)?;
        Ok(payload[1])
    }

    fn unlock_programming(&mut self) -> Result<()> {
        let protection = self.get_status()?;
        if protection & resource::PGM == 0 {
            return Ok(());
        }
        log::info!("Programming is protected, unlocking");

        let seed_key: Box<dyn SeedKey> = match self.seed_key.take() {
            Some(seed_key) => seed_key,
            None => match &self.settings.seed_key_library {
                Some(path) => Box::new(SeedKeyLibrary::open(path)?),
                None => anyhow::bail!("programming is protected but no seed/key library was given"),
            },
        };
        let result = self.unlock_with(seed_key.as_ref(), protection);
        self.seed_key = Some(seed_key);
        result
    }

    fn unlock_with(&mut self, seed_key: &dyn SeedKey, mut protection: u8) -> Result<()> {
        anyhow::ensure!(
            seed_key.available_privileges()? & resource::PGM != 0,
            "seed/key algorithm cannot unlock programming"
        );
        let session = self.active_session()?;
        anyhow::ensure!(session.max_cto > 2, "CTO too small for UNLOCK");

        let seed = self.get_seed(resource::PGM)?;
        if seed.is_empty() {
            // Already unlocked.
            return Ok(());
        }
        let key = seed_key.compute_key(resource::PGM, &seed)?;
        anyhow::ensure!(
            !key.is_empty() && key.len() <= u8::MAX as usize,
            "seed/key algorithm returned a key of {} bytes",
            key.len()
        );

        let part_len = usize::from(session.max_cto) - 2;
        let mut remaining = key.as_slice();
        while !remaining.is_empty() {
            let cnt = remaining.len().min(part_len);
            let cmd = Command::Unlock {
                remaining: remaining.len() as u8,
                key: remaining[..cnt].to_vec(),
            };
            let payload = self.execute(cmd, self.settings.t1, 2..=2)?;
            protection = payload[0];
            remaining = &remaining[cnt..];
        }
        anyhow::ensure!(
            protection & resource::PGM == 0,
            "programming is still protected after UNLOCK"
        );
        log::info!("Programming unlocked");
        Ok(())
    }

    /// Fetch the complete seed for `resource`, in as many GET_SEED parts as needed.
    fn get_seed(&mut self, resource: u8) -> Result<Vec<u8>> {
        let session = self.active_session()?;
        let max_dto = usize::from(session.max_dto);
        anyhow::ensure!(max_dto > 2, "DTO too small for GET_SEED");
        let part_len = max_dto - 2;

        let mut seed = Vec::new();
        let mut mode = 0;
        loop {
            let cmd = Command::GetSeed { mode, resource };
            let payload = self.execute(cmd, self.settings.t1, 3..=max_dto)?;
            let remaining = usize::from(payload[0]);
            let cnt = remaining.min(part_len).min(payload.len() - 1);
            seed.extend_from_slice(&payload[1..1 + cnt]);
            if remaining <= part_len {
                break;
            }
            mode = 1;
        }
        Ok(seed)
    }

    /// Send `cmd` and return the payload of its positive response, which must have a
    /// total length within `expected_len`.
    fn execute(
        &mut self,
        cmd: Command,
        timeout: Duration,
        expected_len: RangeInclusive<usize>,
    ) -> Result<Vec<u8>> {
        let name = cmd.name();
        let order = self.byte_order();
        let resp = self
            .transport
            .transfer(cmd, order, timeout)
            .with_context(|| format!("{} failed", name))?;
        positive(name, resp, expected_len)
    }
}

fn positive(name: &str, resp: Response, expected_len: RangeInclusive<usize>) -> Result<Vec<u8>> {
    match resp {
        Response::Ok(payload) if expected_len.contains(&(payload.len() + 1)) => Ok(payload),
        Response::Ok(payload) => anyhow::bail!(
            "{} response has {} bytes, expected {:?}",
            name,
            payload.len() + 1,
            expected_len
        ),
        Response::Err(code, _) => anyhow::bail!("{} rejected with error code 0x{:02x}", name, code),
    }
}
