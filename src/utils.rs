use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Default name for sessions started without an explicit one
pub fn random_session_name() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("ferrisetw-session-{}", suffix)
}

/// Non-zero starting point for registration handles, so that callers cannot rely on their values
pub fn random_handle_base() -> u64 {
    thread_rng().gen_range(1..=u64::from(u32::MAX)) << 8
}
