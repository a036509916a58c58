//! Parsing of the console's stdin lines.

use shellmux_shell::SessionId;

/// What one line typed at the console asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum Control {
    List,
    Use(SessionId),
    Connect,
    Disconnect,
    CtrlC,
    Clear,
    /// Broadcast a command to every session.
    All(String),
    Quit,
    /// Plain text, typed into the focused session followed by Enter.
    Type(String),
}

/// Lines starting with `/` are commands; `//` escapes a literal leading
/// slash, so `//usr/bin/env` types `/usr/bin/env`.
pub fn parse_control(line: &str) -> Result<Control, String> {
    if let Some(literal) = line.strip_prefix("//") {
        return Ok(Control::Type(format!("/{literal}")));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Control::Type(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    match (name, arg) {
        ("list", "") => Ok(Control::List),
        ("use", id) => id
            .parse()
            .map(Control::Use)
            .map_err(|_| format!("usage: /use <id> (got {id:?})")),
        ("connect", "") => Ok(Control::Connect),
        ("disconnect", "") => Ok(Control::Disconnect),
        ("ctrlc", "") => Ok(Control::CtrlC),
        ("clear", "") => Ok(Control::Clear),
        ("all", "") => Err("usage: /all <command>".to_string()),
        ("all", command) => Ok(Control::All(command.to_string())),
        ("quit", "") => Ok(Control::Quit),
        _ => Err(format!("unknown command: /{rest}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_line_is_typed() {
        assert_eq!(parse_control("ls -la"), Ok(Control::Type("ls -la".to_string())));
        assert_eq!(parse_control(""), Ok(Control::Type(String::new())));
    }

    #[test]
    fn test_double_slash_types_a_path() {
        assert_eq!(
            parse_control("//usr/bin/env"),
            Ok(Control::Type("/usr/bin/env".to_string()))
        );
        assert_eq!(parse_control("//quit"), Ok(Control::Type("/quit".to_string())));
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse_control("/list"), Ok(Control::List));
        assert_eq!(parse_control("/connect"), Ok(Control::Connect));
        assert_eq!(parse_control("/disconnect"), Ok(Control::Disconnect));
        assert_eq!(parse_control("/ctrlc"), Ok(Control::CtrlC));
        assert_eq!(parse_control("/clear"), Ok(Control::Clear));
        assert_eq!(parse_control("/quit"), Ok(Control::Quit));
    }

    #[test]
    fn test_use_takes_an_id() {
        assert_eq!(parse_control("/use 3"), Ok(Control::Use(3)));
        assert!(parse_control("/use web").is_err());
        assert!(parse_control("/use").is_err());
    }

    #[test]
    fn test_all_keeps_the_whole_command() {
        assert_eq!(
            parse_control("/all  df -h /var"),
            Ok(Control::All("df -h /var".to_string()))
        );
        assert!(parse_control("/all").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            parse_control("/reboot now"),
            Err("unknown command: /reboot now".to_string())
        );
        assert!(parse_control("/list extra").is_err());
    }
}
