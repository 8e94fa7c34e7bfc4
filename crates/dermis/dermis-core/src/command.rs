//! Text commands accepted from external tooling.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Close device registration.
    Devs,
    /// End the calibration phase.
    Clbr,
    /// End the regionalization phase.
    Rgn,
}

impl Command {
    const ALL: [(&'static str, Command); 3] = [
        ("devs", Command::Devs),
        ("clbr", Command::Clbr),
        ("rgn", Command::Rgn),
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Command::Devs => "devs",
            Command::Clbr => "clbr",
            Command::Rgn => "rgn",
        }
    }
}

/// Every command found in `text`, in order. Anything between commands is
/// ignored, so `"devs\nrgn"` and `"xdevsyy"` both work.
pub fn scan(text: &str) -> Vec<Command> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match Command::ALL
            .iter()
            .find(|(kw, _)| bytes[i..].starts_with(kw.as_bytes()))
        {
            Some((kw, cmd)) => {
                found.push(*cmd);
                i += kw.len();
            }
            None => i += 1,
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_commands_in_order() {
        assert_eq!(scan("devs"), vec![Command::Devs]);
        assert_eq!(
            scan("clbr\nrgn devs"),
            vec![Command::Clbr, Command::Rgn, Command::Devs]
        );
        assert_eq!(scan("ddevss"), vec![Command::Devs]);
    }

    #[test]
    fn ignores_noise() {
        assert!(scan("").is_empty());
        assert!(scan("dev rg clb").is_empty());
    }
}
