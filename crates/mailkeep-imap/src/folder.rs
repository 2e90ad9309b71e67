//! IMAP folder types

/// Gmail special folders, as flagged in XLIST responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialFolder {
    /// Every message in the account; backups and restores run against it
    AllMail,
}

impl SpecialFolder {
    /// Attribute markers that identify this folder
    ///
    /// XLIST uses Gmail's own name; RFC 6154 servers send `\All` instead.
    pub fn markers(&self) -> &'static [&'static str] {
        match self {
            SpecialFolder::AllMail => &["\\AllMail", "\\All"],
        }
    }
}

/// Represents an IMAP folder/mailbox from a LIST/XLIST response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    /// Folder name (last path segment)
    pub name: String,
    /// Full selectable path
    pub full_path: String,
    /// Hierarchy delimiter (e.g., "/" for Gmail)
    pub delimiter: Option<char>,
    /// Flags, including special-use markers
    pub attributes: Vec<String>,
}

impl Folder {
    /// Create a new folder from a LIST/XLIST response
    pub fn new(full_path: String, delimiter: Option<char>, attributes: Vec<String>) -> Self {
        let name = match delimiter {
            Some(d) => full_path.rsplit(d).next().unwrap_or(&full_path).to_string(),
            None => full_path.clone(),
        };

        Self {
            name,
            full_path,
            delimiter,
            attributes,
        }
    }

    /// Check if this folder can be selected
    pub fn is_selectable(&self) -> bool {
        !self.attributes.iter().any(|a| {
            let lower = a.to_lowercase();
            lower == "\\noselect" || lower == "\\nonexistent"
        })
    }

    /// Whether the folder carries one of `kind`'s markers
    pub fn is(&self, kind: SpecialFolder) -> bool {
        self.attributes.iter().any(|attr| {
            kind.markers()
                .iter()
                .any(|marker| attr.eq_ignore_ascii_case(marker))
        })
    }
}

/// State of the currently selected folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFolder {
    pub full_path: String,
    pub uidvalidity: u32,
    pub message_count: u32,
    pub readonly: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_folder_detection() {
        let all_mail = Folder::new(
            "[Gmail]/All Mail".into(),
            Some('/'),
            vec!["\\HasNoChildren".into(), "\\AllMail".into()],
        );
        assert_eq!(all_mail.name, "All Mail");
        assert!(all_mail.is(SpecialFolder::AllMail));

        let rfc6154 = Folder::new("[Gmail]/All Mail".into(), Some('/'), vec!["\\All".into()]);
        assert!(rfc6154.is(SpecialFolder::AllMail));
    }

    #[test]
    fn test_other_special_folders_do_not_match() {
        let inbox = Folder::new("INBOX".into(), Some('/'), vec!["\\Inbox".into()]);
        assert!(!inbox.is(SpecialFolder::AllMail));
        let flagged = Folder::new("[Gmail]/Starred".into(), Some('/'), vec!["\\Flagged".into()]);
        assert!(!flagged.is(SpecialFolder::AllMail));
    }

    #[test]
    fn test_selectable() {
        let parent = Folder::new("[Gmail]".into(), Some('/'), vec!["\\Noselect".into()]);
        assert!(!parent.is_selectable());
        assert!(Folder::new("INBOX".into(), Some('/'), vec![]).is_selectable());
    }
}
