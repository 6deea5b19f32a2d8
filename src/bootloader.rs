//! The bootloader context, owning the platform and all protocol state
//!
//! Data flow for every received frame:
//!
//! ```text
//! CAN frame -> IsoTpCodec (reassembly) -> UdsServer -> IsoTpCodec (segmentation) -> CAN
//! ```
//!
//! All state lives in [Bootloader] and is only touched through `&mut self`, so a single owner
//! (interrupt handler or thread) drives it. Wrap it in a mutex if frames are delivered from
//! more than one context.

use log::{error, info, warn};

use crate::{
    BootloaderError, BootloaderResult,
    channel::{CanFrame, MAX_STANDARD_ID},
    hardware::Hardware,
    isotp::{IsoTpCodec, IsoTpEvent, IsoTpSettings, MAX_PAYLOAD_LEN},
    status_log::{IapStatus, IapStatusRecord, LogError, LogLayout, WearLevelLog},
    uds::{PendingOperation, SessionState, UdsError, UdsServer, UdsServerOptions, make_nrc},
};

/// Bootloader configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BootloaderOptions {
    /// CAN ID the tester sends requests on
    pub rx_id: u32,
    /// CAN ID responses are sent on
    pub tx_id: u32,
    /// ISO-TP settings
    pub isotp: IsoTpSettings,
    /// UDS server settings
    pub uds: UdsServerOptions,
    /// Placement of the status log
    pub status_log: LogLayout,
}

impl Default for BootloaderOptions {
    fn default() -> Self {
        Self {
            rx_id: 0x707,
            tx_id: 0x70F,
            isotp: IsoTpSettings::default(),
            uds: UdsServerOptions::default(),
            status_log: LogLayout::default(),
        }
    }
}

impl BootloaderOptions {
    /// Checks the options are consistent with each other
    pub fn validate(&self) -> BootloaderResult<()> {
        if self.rx_id > MAX_STANDARD_ID || self.tx_id > MAX_STANDARD_ID {
            return Err(BootloaderError::InvalidConfig("CAN IDs must be 11 bit"));
        }
        if self.rx_id == self.tx_id {
            return Err(BootloaderError::InvalidConfig("Rx and Tx IDs must differ"));
        }
        let region = self.uds.program_region;
        if region.is_empty() || region.start % 4 != 0 || region.end % 4 != 0 {
            return Err(BootloaderError::InvalidConfig(
                "program region must be non empty and word aligned",
            ));
        }
        let block = self.uds.transfer_block_size as usize;
        if block <= 2 || self.uds.block_data_len() % 4 != 0 {
            return Err(BootloaderError::InvalidConfig(
                "transfer block must carry whole words",
            ));
        }
        if block > self.isotp.rx_capacity.min(MAX_PAYLOAD_LEN) {
            return Err(BootloaderError::InvalidConfig(
                "transfer block does not fit the ISO-TP buffer",
            ));
        }
        self.status_log.validate()?;
        Ok(())
    }
}

/// Outcome of [Bootloader::boot]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BootDecision {
    /// Control was handed to the application. Only observable on simulated hardware
    Jumped,
    /// Staying in the bootloader to wait for a tester
    StayInBootloader {
        /// Status found in the log
        status: IapStatus,
    },
}

/// CAN bootloader: ISO-TP codec, UDS server and status log on top of a [Hardware] platform
#[derive(Debug)]
pub struct Bootloader<H: Hardware> {
    hw: H,
    isotp: IsoTpCodec,
    server: UdsServer,
    log: WearLevelLog,
}

impl<H: Hardware> Bootloader<H> {
    /// Creates a bootloader. Fails if `options` are inconsistent
    pub fn new(hw: H, options: BootloaderOptions) -> BootloaderResult<Self> {
        options.validate()?;
        let log = WearLevelLog::new(options.status_log)?;
        Ok(Self {
            hw,
            isotp: IsoTpCodec::new(options.rx_id, options.tx_id, options.isotp),
            server: UdsServer::new(options.uds),
            log,
        })
    }

    /// The platform
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// The platform, mutably
    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Current UDS session
    pub fn session(&self) -> SessionState {
        self.server.session()
    }

    /// The status log accessor
    pub fn status_log(&self) -> &WearLevelLog {
        &self.log
    }

    /// Newest status record, if any
    pub fn status(&self) -> BootloaderResult<Option<IapStatusRecord>> {
        Ok(self.log.read_latest(&self.hw)?.map(|l| l.record))
    }

    /// Decides at power up whether to start the application.
    ///
    /// The application is started if the log says [IapStatus::AppDone] and the image is visible.
    /// A corrupt log is erased and treated as [IapStatus::NoApp]
    pub fn boot(&mut self) -> BootloaderResult<BootDecision> {
        let latest = match self.log.read_latest(&self.hw) {
            Ok(latest) => latest.map(|l| l.record),
            Err(LogError::Corrupt { sub_area }) => {
                warn!("Status log corrupt in sub-area {sub_area}, erasing");
                self.log.erase(&mut self.hw)?;
                None
            }
            Err(e) => return Err(e.into()),
        };
        let status = latest.map_or(IapStatus::NoApp, |r| r.status);
        info!("Boot status: {status}");
        if status == IapStatus::AppDone && self.hw.check_new_app_visible() {
            match self.hw.jump_to_application() {
                Ok(()) => return Ok(BootDecision::Jumped),
                Err(e) => error!("Could not start application: {e}"),
            }
        }
        Ok(BootDecision::StayInBootloader { status })
    }

    /// Handles a frame received from the bus, sending whatever it causes
    pub fn on_can_frame(&mut self, frame: &CanFrame) -> BootloaderResult<()> {
        match self.isotp.on_frame(frame, &mut self.hw)? {
            None => Ok(()),
            Some(IsoTpEvent::Aborted { sid }) => {
                let nrc = make_nrc(sid, UdsError::TransferDataSuspended);
                self.isotp.send_message(&nrc, &mut self.hw)?;
                Ok(())
            }
            Some(IsoTpEvent::Payload(req)) => {
                let sent = match self.server.process(&req, &mut self.hw, &self.log) {
                    Some(resp) => self.isotp.send_message(&resp, &mut self.hw),
                    None => Ok(()),
                };
                // Deferred work only runs once the tester has its answer
                let pending = self.server.take_pending();
                sent?;
                self.run_pending(pending);
                Ok(())
            }
        }
    }

    fn run_pending(&mut self, pending: PendingOperation) {
        if pending == PendingOperation::JumpToApplication {
            info!("Jumping to application");
            match self.hw.jump_to_application() {
                Ok(()) => info!("Application started"),
                Err(e) => error!("Could not start application: {e}"),
            }
        }
    }
}
