//! Parsing of raw IMAP response text
//!
//! Everything here works on already-framed responses: the client collects
//! each response line (with any literals it announced) into a
//! [`ResponseItem`], and the helpers below turn those into typed values.
//! Nothing outside this crate sees response text.

use crate::message::{parse_internal_date, FetchedMessage, Uid};
use crate::{Folder, ImapError, ImapResult};
use std::fmt;

/// Completion status of a tagged response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        })
    }
}

/// One response line, literals included
///
/// `text` holds the line with literal markers (`{123}`) still in place; the
/// literal payloads are in `literals`, in order of appearance.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ResponseItem {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

/// A complete command response
#[derive(Debug, Clone)]
pub(crate) struct Response {
    pub status: Status,
    /// Tagged line text after the status word
    pub text: String,
    pub untagged: Vec<ResponseItem>,
}

impl Response {
    /// Turn NO/BAD into an error naming the command
    pub fn ok_or_failed(self, command: &str) -> ImapResult<Self> {
        if self.status == Status::Ok {
            Ok(self)
        } else {
            Err(ImapError::CommandFailed {
                command: command.to_string(),
                status: self.status,
                text: self.text,
            })
        }
    }

    /// Untagged items whose text starts with `* <keyword>`
    pub fn untagged_with<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a ResponseItem> {
        self.untagged
            .iter()
            .filter(move |item| untagged_keyword(&item.text).eq_ignore_ascii_case(keyword))
    }
}

/// Parsed IMAP value
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Atom(String),
    Quoted(String),
    List(Vec<Value>),
    /// Index into the item's literals
    Literal(usize),
    Nil,
}

impl Value {
    /// String form of an atom, quoted string or literal
    fn as_string(&self, literals: &[Vec<u8>]) -> Option<String> {
        match self {
            Value::Atom(s) | Value::Quoted(s) => Some(s.clone()),
            Value::Literal(ix) => literals
                .get(*ix)
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
            Value::List(_) | Value::Nil => None,
        }
    }
}

/// Split a tagged line into (tag, status, rest)
pub(crate) fn parse_tagged(line: &str) -> Option<(&str, Status, &str)> {
    let (tag, rest) = line.split_once(' ')?;
    let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        _ => return None,
    };
    Some((tag, status, text))
}

/// Size announced by a literal marker ending the line, e.g. `... {1234}`
pub(crate) fn literal_size(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// The word after `* `, skipping a leading message number
/// (`* 12 FETCH ...` gives `FETCH`)
fn untagged_keyword(text: &str) -> &str {
    let mut words = text.strip_prefix("* ").unwrap_or("").split(' ');
    match words.next() {
        Some(first) if first.bytes().all(|b| b.is_ascii_digit()) && !first.is_empty() => {
            words.next().unwrap_or("")
        }
        Some(first) => first,
        None => "",
    }
}

/// Text of an untagged item after its keyword
fn untagged_rest<'a>(text: &'a str, keyword: &str) -> &'a str {
    let mut rest = text.strip_prefix("* ").unwrap_or(text);
    if let Some((first, after)) = rest.split_once(' ') {
        if !first.is_empty() && first.bytes().all(|b| b.is_ascii_digit()) {
            rest = after;
        }
    }
    match rest.split_once(' ') {
        Some((word, after)) if word.eq_ignore_ascii_case(keyword) => after.trim_start(),
        _ => "",
    }
}

/// Response code in brackets at the start of status text, e.g.
/// `[APPENDUID 38505 3955] (Success)` gives `("APPENDUID", "38505 3955")`
pub(crate) fn response_code(text: &str) -> Option<(String, &str)> {
    let inner = text.trim_start().strip_prefix('[')?;
    let inner = &inner[..inner.find(']')?];
    let (name, args) = inner.split_once(' ').unwrap_or((inner, ""));
    Some((name.to_ascii_uppercase(), args))
}

/// Tokenize IMAP response text into values
pub(crate) fn parse_values(text: &str) -> Vec<Value> {
    let chars: Vec<char> = text.chars().collect();
    let mut pos = 0;
    let mut literal_count = 0;
    let mut values = Vec::new();
    while let Some(value) = next_value(&chars, &mut pos, &mut literal_count) {
        values.push(value);
    }
    values
}

fn next_value(chars: &[char], pos: &mut usize, literal_count: &mut usize) -> Option<Value> {
    while *pos < chars.len() && chars[*pos] == ' ' {
        *pos += 1;
    }
    if *pos >= chars.len() {
        return None;
    }

    match chars[*pos] {
        ')' => None,
        '(' => {
            *pos += 1;
            let mut items = Vec::new();
            while let Some(value) = next_value(chars, pos, literal_count) {
                items.push(value);
            }
            // Skip the closing paren, if present
            if *pos < chars.len() {
                *pos += 1;
            }
            Some(Value::List(items))
        }
        '"' => {
            *pos += 1;
            let mut s = String::new();
            while *pos < chars.len() && chars[*pos] != '"' {
                if chars[*pos] == '\\' && *pos + 1 < chars.len() {
                    *pos += 1;
                }
                s.push(chars[*pos]);
                *pos += 1;
            }
            *pos += 1;
            Some(Value::Quoted(s))
        }
        '{' => {
            while *pos < chars.len() && chars[*pos] != '}' {
                *pos += 1;
            }
            *pos += 1;
            let ix = *literal_count;
            *literal_count += 1;
            Some(Value::Literal(ix))
        }
        _ => {
            // Atom; a bracketed section (BODY[HEADER.FIELDS (X)]) is part of it
            let mut s = String::new();
            let mut depth = 0usize;
            while *pos < chars.len() {
                let c = chars[*pos];
                match c {
                    '[' => depth += 1,
                    ']' => depth = depth.saturating_sub(1),
                    ' ' | '(' | ')' if depth == 0 => break,
                    _ => {}
                }
                s.push(c);
                *pos += 1;
            }
            if s.eq_ignore_ascii_case("NIL") {
                Some(Value::Nil)
            } else {
                Some(Value::Atom(s))
            }
        }
    }
}

/// `* CAPABILITY IMAP4rev1 X-GM-EXT-1 ...`
pub(crate) fn parse_capabilities(response: &Response) -> Vec<String> {
    response
        .untagged_with("CAPABILITY")
        .flat_map(|item| {
            untagged_rest(&item.text, "CAPABILITY")
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// `* ID ("name" "GImap" "vendor" "Google, Inc.")` as a flat list of words
pub(crate) fn parse_id(response: &Response) -> ImapResult<Vec<String>> {
    let Some(item) = response.untagged_with("ID").next() else {
        return Ok(Vec::new());
    };
    let rest = untagged_rest(&item.text, "ID");
    let inner = match rest.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => inner,
        None => return Ok(Vec::new()), // NIL
    };
    shell_words::split(inner).map_err(|e| ImapError::ParseError(format!("ID response: {}", e)))
}

/// `* SEARCH 3 5 8` lines, concatenated
pub(crate) fn parse_search(response: &Response) -> ImapResult<Vec<Uid>> {
    let mut uids = Vec::new();
    for item in response.untagged_with("SEARCH") {
        for token in untagged_rest(&item.text, "SEARCH").split_whitespace() {
            let uid = Uid::new(token)
                .ok_or_else(|| ImapError::ParseError(format!("bad UID in SEARCH: {}", token)))?;
            uids.push(uid);
        }
    }
    Ok(uids)
}

/// `* XLIST (\HasNoChildren \AllMail) "/" "[Gmail]/All Mail"`
pub(crate) fn parse_list_item(item: &ResponseItem, keyword: &str) -> Option<Folder> {
    let values = parse_values(untagged_rest(&item.text, keyword));
    let mut values = values.into_iter();

    let attributes = match values.next()? {
        Value::List(flags) => flags
            .iter()
            .filter_map(|v| v.as_string(&item.literals))
            .collect(),
        _ => return None,
    };
    let delimiter = match values.next()? {
        Value::Quoted(d) => d.chars().next(),
        _ => None,
    };
    let name = values.next()?.as_string(&item.literals)?;

    Some(Folder::new(name, delimiter, attributes))
}

/// UIDVALIDITY and EXISTS from a SELECT/EXAMINE response
pub(crate) fn parse_select(response: &Response) -> (Option<u32>, u32) {
    let mut uidvalidity = None;
    let mut exists = 0;
    for item in &response.untagged {
        let rest = item.text.strip_prefix("* ").unwrap_or("");
        if let Some(status_text) = rest.strip_prefix("OK ") {
            if let Some((code, args)) = response_code(status_text) {
                if code == "UIDVALIDITY" {
                    uidvalidity = args.trim().parse().ok();
                }
            }
        } else if let Some((count, word)) = rest.split_once(' ') {
            if word.eq_ignore_ascii_case("EXISTS") {
                exists = count.parse().unwrap_or(0);
            }
        }
    }
    (uidvalidity, exists)
}

/// `OK [APPENDUID <uidvalidity> <uid>] ...`
pub(crate) fn parse_appenduid(text: &str) -> Option<Uid> {
    let (code, args) = response_code(text)?;
    if code != "APPENDUID" {
        return None;
    }
    let mut parts = args.split_whitespace();
    let _uidvalidity = parts.next()?;
    Uid::new(parts.next()?)
}

/// Parse one `* n FETCH (...)` item
///
/// Returns `None` for FETCH items carrying no UID (unsolicited flag updates).
/// Attribute order is not assumed.
pub(crate) fn parse_fetch(item: &ResponseItem) -> ImapResult<Option<FetchedMessage>> {
    let values = parse_values(untagged_rest(&item.text, "FETCH"));
    let attrs = match values.into_iter().next() {
        Some(Value::List(attrs)) => attrs,
        _ => {
            return Err(ImapError::ParseError(format!(
                "FETCH without attribute list: {}",
                item.text
            )))
        }
    };

    let mut uid = None;
    let mut fetched = FetchedMessageParts::default();

    let mut iter = attrs.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        let Value::Atom(key) = key else {
            return Err(ImapError::ParseError(format!("bad FETCH key in: {}", item.text)));
        };
        let key = key.to_ascii_uppercase();
        match key.as_str() {
            "UID" => uid = value.as_string(&item.literals).and_then(Uid::new),
            "X-GM-LABELS" => fetched.labels = string_list(&value, &item.literals),
            "FLAGS" => fetched.flags = string_list(&value, &item.literals),
            "INTERNALDATE" => {
                let raw = value.as_string(&item.literals).unwrap_or_default();
                fetched.internal_date = Some(parse_internal_date(&raw).ok_or_else(|| {
                    ImapError::ParseError(format!("bad INTERNALDATE: {}", raw))
                })?);
            }
            "RFC822.SIZE" => {
                fetched.size = value.as_string(&item.literals).and_then(|s| s.parse().ok())
            }
            "BODY[]" => fetched.body = literal_bytes(&value, &item.literals),
            k if k.starts_with("BODY[HEADER") => {
                fetched.header = literal_bytes(&value, &item.literals)
            }
            _ => {}
        }
    }

    Ok(uid.map(|uid| {
        let mut message = FetchedMessage::new(uid);
        message.labels = fetched.labels;
        message.flags = fetched.flags;
        message.internal_date = fetched.internal_date;
        message.size = fetched.size;
        message.body = fetched.body;
        message.header = fetched.header;
        message
    }))
}

#[derive(Default)]
struct FetchedMessageParts {
    labels: Vec<String>,
    flags: Vec<String>,
    internal_date: Option<chrono::DateTime<chrono::FixedOffset>>,
    size: Option<u64>,
    body: Option<Vec<u8>>,
    header: Option<Vec<u8>>,
}

fn string_list(value: &Value, literals: &[Vec<u8>]) -> Vec<String> {
    match value {
        Value::List(items) => items.iter().filter_map(|v| v.as_string(literals)).collect(),
        _ => Vec::new(),
    }
}

fn literal_bytes(value: &Value, literals: &[Vec<u8>]) -> Option<Vec<u8>> {
    match value {
        Value::Literal(ix) => literals.get(*ix).cloned(),
        Value::Quoted(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Quote a string for use as an IMAP quoted-string
pub(crate) fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Gmail system labels (`\Inbox`, `\Starred`) go out as bare atoms,
/// everything else quoted
pub(crate) fn label_arg(label: &str) -> String {
    match label.strip_prefix('\\') {
        Some(rest) if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()) => {
            label.to_string()
        }
        _ => quote(label),
    }
}
