/// Serial framing of the collection unit: 9600 baud, 8 data bits, no parity, 1 stop bit.
///
/// The device firmware does not negotiate; both the direct link and the proxy server open the
/// port with exactly these settings.
pub const BAUD_RATE: u32 = 9600;

/// Appended to every outgoing command.
pub const LINE_TERMINATOR: &str = "\r\n";

pub const TOKEN_OPEN: u8 = b'(';
pub const TOKEN_CLOSE: u8 = b')';

/// Wraps a command in brackets unless it already is.
pub fn bracketed(command: &str) -> String {
    let command = command.trim();
    if command.starts_with('(') && command.ends_with(')') {
        command.to_string()
    } else {
        format!("({command})")
    }
}

#[cfg(test)]
mod tests {
    use super::bracketed;

    #[test]
    fn bracketed_is_idempotent() {
        assert_eq!(bracketed("IWRP"), "(IWRP)");
        assert_eq!(bracketed("(IWRP)"), "(IWRP)");
    }
}
