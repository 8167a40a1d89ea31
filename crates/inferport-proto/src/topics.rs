use rand::RngCore;

pub const REQUESTS_TOPIC: &str = "device/requests";
pub const RESPONSES_BASE: &str = "device/responses";

pub fn response_topic(client_id: &str) -> String {
    format!("{RESPONSES_BASE}/{client_id}")
}

/// `device-` followed by 8 random hex characters.
pub fn new_client_id() -> String {
    let mut suffix = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut suffix);
    format!("device-{}", hex::encode(suffix))
}

/// Correlation key for one offload request: 128 bits from the OS RNG.
pub fn new_request_id() -> String {
    let mut token = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut token);
    hex::encode(token)
}
