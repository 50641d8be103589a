use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn base36(mut v: u64) -> String {
    let alphabet = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut s = String::new();
    if v == 0 {
        s.push('0');
    } else {
        while v > 0 {
            let idx = (v % 36) as usize;
            s.push(alphabet[idx] as char);
            v /= 36;
        }
    }
    s.chars().rev().collect()
}

/// Short, log-friendly connection id: base36 of time^pid plus a process-local sequence.
pub fn connection_id() -> String {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let pid = std::process::id() as u128;
    let mix = now.as_nanos() ^ pid;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("c{}-{}", base36((mix & 0xffffffffff) as u64), base36(seq))
}

/// Mint a setup token. Tokens are compared for equality only, so they must never repeat
/// within a process: 128 random bits, with a counter suffix when the OS RNG is unavailable.
pub fn setup_token() -> String {
    let mut buf = [0u8; 16];
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    match getrandom::getrandom(&mut buf) {
        Ok(()) => buf.iter().map(|b| format!("{b:02x}")).collect(),
        Err(_) => {
            let nanos = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            format!("{nanos:x}-{seq:x}")
        }
    }
}

/// Durable session ids are UUIDv4.
pub fn session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
