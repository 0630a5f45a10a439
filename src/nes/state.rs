//! Save-state blob.
//!
//! Each component hands back its raw state; binary fields are carried as
//! base64 strings so the whole blob is plain JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PpuState {
    #[serde(with = "b64")]
    pub regs: Vec<u8>,
    #[serde(with = "b64")]
    pub oam: Vec<u8>,
    pub mirror_mode: u8,
    /// Full 16KB VRAM. Only present when the cartridge uses CHR RAM.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub vram: Option<Vec<u8>>,
    /// VRAM from `$2000` up. Present when CHR comes from ROM.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub vram_high: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveState {
    pub mapper_id: u16,
    #[serde(with = "b64")]
    pub cpu: Vec<u8>,
    #[serde(with = "b64")]
    pub ram: Vec<u8>,
    #[serde(with = "b64")]
    pub prg_ram: Vec<u8>,
    pub ppu: PpuState,
    #[serde(with = "b64")]
    pub apu: Vec<u8>,
    #[serde(with = "b64")]
    pub mapper: Vec<u8>,
    pub hcount: u16,
    pub line_dots: u32,
}

impl SaveState {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode save state")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to decode save state")
    }
}

mod b64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}

mod b64_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|text| STANDARD.decode(text.as_bytes()).map_err(D::Error::custom))
            .transpose()
    }
}
