//! Canonical folder names and the ordered spam alias table.

/// IMAP name of the inbox on every server.
pub const INBOX: &str = "INBOX";

/// Provider spam/junk folder names, in search priority order.
pub const SPAM_ALIASES: &[&str] = &[
    "[Gmail]/Spam",
    "Spam",
    "Junk",
    "Junk E-mail",
    "Junk Email",
    "Bulk Mail",
    "INBOX.Spam",
    "INBOX.Junk",
    "INBOX/Spam",
    "INBOX/Junk",
    "[Gmail]/Junk",
];

/// Spam folders present on the server, in alias-table order, using the
/// server's own spelling of each name.
///
/// Server listing order is ignored so results are reproducible.
pub fn spam_folders_present(server_folders: &[String]) -> Vec<String> {
    SPAM_ALIASES
        .iter()
        .filter_map(|alias| {
            server_folders
                .iter()
                .find(|folder| folder.trim().eq_ignore_ascii_case(alias))
                .map(|folder| folder.trim().to_string())
        })
        .collect()
}

pub fn is_inbox(folder: &str) -> bool {
    folder.trim().eq_ignore_ascii_case(INBOX)
}
