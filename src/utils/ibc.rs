use sha2::{Digest, Sha256};

use crate::errors::{AppError, AppResult};

const IBC_PREFIX: &str = "ibc";
const TRANSFER_PORT: &str = "transfer";

/// Derives the voucher denom a token receives when it arrives over the given
/// transfer channel.
pub fn ibc_denom(channel_id: &str, denom: &str) -> AppResult<String> {
    if channel_id.is_empty() || denom.is_empty() {
        return Err(AppError::Config(
            "channel ID and denom cannot be empty".into(),
        ));
    }

    let trace = format!("{TRANSFER_PORT}/{channel_id}/{denom}");
    let digest = Sha256::digest(trace.as_bytes());
    Ok(format!("{IBC_PREFIX}/{}", hex::encode_upper(digest)))
}
