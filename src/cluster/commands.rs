//! Administrative command text for primary/follower replication.
//!
//! Only simple token scanning is done on command output.

use serde::Serialize;

/// Flush, read the primary status and release the lock in one round trip
pub const CAPTURE_LOG_POSITION: &str =
    "FLUSH TABLES WITH READ LOCK;SHOW MASTER STATUS \\G UNLOCK TABLES;";

/// Replication coordinates published by the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPosition {
    pub file: String,
    pub position: i64,
}

/// Create the replication account; safe to run again
pub fn create_replication_user(user: &str, password: &str) -> String {
    format!(
        "CREATE USER IF NOT EXISTS '{user}'@'%' IDENTIFIED BY '{password}';\n\
         GRANT REPLICATION SLAVE ON *.* TO '{user}'@'%';\n",
        user = quote(user),
        password = quote(password),
    )
}

/// Point a follower at the primary's log position
pub fn change_primary_command(
    host: &str,
    user: &str,
    password: &str,
    position: &LogPosition,
) -> String {
    format!(
        "CHANGE MASTER TO MASTER_HOST='{}', MASTER_USER='{}', MASTER_PASSWORD='{}', \
         MASTER_LOG_FILE='{}', MASTER_LOG_POS={}",
        quote(host),
        quote(user),
        quote(password),
        quote(&position.file),
        position.position
    )
}

/// Scan `SHOW MASTER STATUS \G` style output for the file and position.
///
/// Tokens are split on newlines and colons, trimmed, empties dropped; the
/// token after `File` is the log file and the token after `Position` the
/// offset.
pub fn parse_log_position(output: &str) -> Option<LogPosition> {
    let mut tokens = output
        .split(|c| c == '\n' || c == ':')
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let mut file = None;
    let mut position = None;
    while let Some(token) = tokens.next() {
        match token {
            "File" => file = tokens.next().map(str::to_string),
            "Position" => position = tokens.next().and_then(|p| p.parse::<i64>().ok()),
            _ => {}
        }
    }

    Some(LogPosition {
        file: file?,
        position: position?,
    })
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vertical_status() {
        let output = "*************************** 1. row ***************************\n\
                      File: mysql-bin.000003\n\
                      Position: 73\n\
                      Binlog_Do_DB: \n\
                      Binlog_Ignore_DB: \n";
        assert_eq!(
            parse_log_position(output),
            Some(LogPosition {
                file: "mysql-bin.000003".into(),
                position: 73
            })
        );
    }

    #[test]
    fn test_parse_compact_status() {
        assert_eq!(
            parse_log_position("File: bin.000001\nPosition: 4"),
            Some(LogPosition {
                file: "bin.000001".into(),
                position: 4
            })
        );
    }

    #[test]
    fn test_parse_missing_fields() {
        assert_eq!(parse_log_position(""), None);
        assert_eq!(parse_log_position("File: bin.000001"), None);
        assert_eq!(parse_log_position("File: bin.000001\nPosition: abc"), None);
    }

    #[test]
    fn test_commands_quote_values() {
        let cmd = create_replication_user("repl", "it's");
        assert!(cmd.starts_with("CREATE USER IF NOT EXISTS 'repl'@'%' IDENTIFIED BY 'it''s';"));
        assert!(cmd.contains("GRANT REPLICATION SLAVE ON *.* TO 'repl'@'%';"));

        let position = LogPosition {
            file: "bin.000001".into(),
            position: 4,
        };
        assert_eq!(
            change_primary_command("10.0.0.1", "repl", "pw", &position),
            "CHANGE MASTER TO MASTER_HOST='10.0.0.1', MASTER_USER='repl', MASTER_PASSWORD='pw', \
             MASTER_LOG_FILE='bin.000001', MASTER_LOG_POS=4"
        );
    }
}
