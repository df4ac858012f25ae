//! Session identifier (CVID) encoding and decoding
//!
//! A CVID is a positive 31-bit integer that identifies an instance on the
//! mesh for the duration of a session. For a long-term identity, use the
//! instance UUID instead.
//!
//! ```text
//!               0         1         2           3
//!               012345678901234567890123 45678 901
//! CVID anatomy: [0       random base    | FID |IID]
//! ```
//!
//! The instance id (IID) encodes the instance type, the flavor id (FID)
//! encodes the instance flavor, and the random base distinguishes instances
//! of the same kind. Zero is never a valid CVID; its presence in a field
//! means "unset".

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Session identifier. Positive when set, 0 when unset.
pub type Cvid = i32;

/// Number of bits used to encode the instance type (IID)
pub const IID_SPACE: u32 = 3;

/// Number of bits used to encode the instance flavor (FID)
pub const FID_SPACE: u32 = 5;

/// The kind of process an instance is running as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceType {
    /// Decoded from a number outside the defined range
    Unrecognized,
    /// Coordinating server
    Server,
    /// Interactive client/viewer
    Client,
    /// Headless agent
    Agent,
}

impl InstanceType {
    /// The numeric value packed into the IID field
    pub fn number(self) -> u32 {
        match self {
            InstanceType::Unrecognized => u32::MAX,
            InstanceType::Server => 1,
            InstanceType::Client => 2,
            InstanceType::Agent => 3,
        }
    }

    /// Inverse of [`number`](Self::number); unknown values decode as Unrecognized
    pub fn from_number(number: u32) -> Self {
        match number {
            1 => InstanceType::Server,
            2 => InstanceType::Client,
            3 => InstanceType::Agent,
            _ => InstanceType::Unrecognized,
        }
    }

    /// All defined instance types, excluding the Unrecognized sentinel
    pub fn all() -> [InstanceType; 3] {
        [
            InstanceType::Server,
            InstanceType::Client,
            InstanceType::Agent,
        ]
    }
}

/// Sub-variant of an instance type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceFlavor {
    /// Decoded from a number outside the defined range
    Unrecognized,
    /// No particular flavor
    None,
    /// Command-line frontend
    Cli,
    /// Graphical frontend
    Gui,
    /// Fully headless build
    Headless,
}

impl InstanceFlavor {
    /// The numeric value packed into the FID field
    pub fn number(self) -> u32 {
        match self {
            InstanceFlavor::Unrecognized => u32::MAX,
            InstanceFlavor::None => 0,
            InstanceFlavor::Cli => 1,
            InstanceFlavor::Gui => 2,
            InstanceFlavor::Headless => 3,
        }
    }

    /// Inverse of [`number`](Self::number); unknown values decode as Unrecognized
    pub fn from_number(number: u32) -> Self {
        match number {
            0 => InstanceFlavor::None,
            1 => InstanceFlavor::Cli,
            2 => InstanceFlavor::Gui,
            3 => InstanceFlavor::Headless,
            _ => InstanceFlavor::Unrecognized,
        }
    }

    /// All defined flavors, excluding the Unrecognized sentinel
    pub fn all() -> [InstanceFlavor; 4] {
        [
            InstanceFlavor::None,
            InstanceFlavor::Cli,
            InstanceFlavor::Gui,
            InstanceFlavor::Headless,
        ]
    }
}

/// Generate a new random CVID for the given identity.
///
/// Note: there is a small chance this returns the invalid sentinel 0 when
/// all base bits collapse to zero. Callers that cannot tolerate an unset id
/// must check the output and regenerate; [`mint`] does exactly that.
pub fn encode(instance: InstanceType, flavor: InstanceFlavor) -> NetResult<Cvid> {
    if instance == InstanceType::Unrecognized {
        return Err(NetError::InvalidInstance(
            "unrecognized instance type".into(),
        ));
    }
    if flavor == InstanceFlavor::Unrecognized {
        return Err(NetError::InvalidInstance(
            "unrecognized instance flavor".into(),
        ));
    }

    let mut packed: u32 = rand::random();

    // Add flavor id
    packed = (packed << FID_SPACE) | flavor.number();

    // Add instance id
    packed = (packed << IID_SPACE) | instance.number();

    // Ensure positive
    Ok((packed & 0x7FFF_FFFF) as Cvid)
}

/// Like [`encode`], but loops until the result is a valid (nonzero) CVID.
pub fn mint(instance: InstanceType, flavor: InstanceFlavor) -> NetResult<Cvid> {
    loop {
        let cvid = encode(instance, flavor)?;
        if cvid != 0 {
            return Ok(cvid);
        }
    }
}

/// Extract the instance type from a CVID
pub fn extract_instance(cvid: Cvid) -> InstanceType {
    let iid = (cvid as u32) & ((1 << IID_SPACE) - 1);
    InstanceType::from_number(iid)
}

/// Extract the instance flavor from a CVID
pub fn extract_flavor(cvid: Cvid) -> InstanceFlavor {
    let fid = ((cvid as u32) >> IID_SPACE) & ((1 << FID_SPACE) - 1);
    InstanceFlavor::from_number(fid)
}
