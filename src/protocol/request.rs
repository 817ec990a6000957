//! Request body parsing

/// One command line of a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Upper-cased command name
    pub name: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Raw text of the line, for logging.
    pub fn render(&self) -> String {
        if self.args.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.args.join(" "))
        }
    }
}

/// Split a request body into command lines.
///
/// Lines are separated by `\n`, tokens by spaces. Empty tokens and blank
/// lines are skipped. Argument count is not checked here.
pub fn parse_request(body: &[u8]) -> Vec<CommandLine> {
    let text = String::from_utf8_lossy(body);
    text.split('\n')
        .filter_map(|line| {
            let mut tokens = line
                .trim_end_matches('\r')
                .split(' ')
                .filter(|t| !t.is_empty());
            let name = tokens.next()?.to_uppercase();
            Some(CommandLine {
                name,
                args: tokens.map(str::to_string).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_command() {
        let lines = parse_request(b"ping");
        assert_eq!(lines, vec![CommandLine { name: "PING".into(), args: vec![] }]);
    }

    #[test]
    fn test_parse_batch_with_args() {
        let lines = parse_request(b"select foo\nadd  bar\n\nHASCOUNT bar\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].name, "SELECT");
        assert_eq!(lines[0].args, vec!["foo"]);
        assert_eq!(lines[1].name, "ADD");
        assert_eq!(lines[1].args, vec!["bar"]);
        assert_eq!(lines[2].render(), "HASCOUNT bar");
    }

    #[test]
    fn test_arguments_keep_case() {
        let lines = parse_request(b"import /tmp/Dump.trie MyDb");
        assert_eq!(lines[0].name, "IMPORT");
        assert_eq!(lines[0].args, vec!["/tmp/Dump.trie", "MyDb"]);
    }

    #[test]
    fn test_blank_body() {
        assert!(parse_request(b"").is_empty());
        assert!(parse_request(b"  \n \n").is_empty());
    }

    #[test]
    fn test_carriage_returns_stripped() {
        let lines = parse_request(b"PING\r\nINFO\r\n");
        assert_eq!(lines.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(), vec!["PING", "INFO"]);
    }
}
