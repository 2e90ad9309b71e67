//! Gmail IMAP client speaking the raw protocol
//!
//! Commands are written by hand and responses framed line by line (with
//! `{N}` literals) over a [`CompressedTransport`]. Only the commands the sync
//! engine needs are implemented, plus the Gmail extensions: `X-GM-RAW`
//! search, `X-GM-LABELS`, `XLIST`, `ID` and `COMPRESS DEFLATE`.

use async_native_tls::TlsConnector;
use async_std::net::TcpStream;
use chrono::{DateTime, FixedOffset};
use futures::io::{AsyncRead, AsyncWrite};
use mailkeep_auth::XOAuth2Token;
use tracing::{debug, info, warn};

use crate::folder::{Folder, SelectedFolder, SpecialFolder};
use crate::message::{format_internal_date, FetchItems, FetchedMessage, Uid};
use crate::response::{
    label_arg, literal_size, parse_appenduid, parse_capabilities, parse_fetch, parse_id,
    parse_list_item, parse_search, parse_select, parse_tagged, quote, Response, ResponseItem,
    Status,
};
use crate::transport::{CompressedTransport, TransportStats};
use crate::{ImapError, ImapResult};

/// TLS stream used for real connections
pub type TlsStream = async_native_tls::TlsStream<TcpStream>;

/// Capability advertised by servers with the Gmail extensions
pub const VENDOR_CAPABILITY: &str = "X-GM-EXT-1";

/// What we tell the server about ourselves in `ID`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub version: String,
    pub vendor: String,
    pub contact: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: "mailkeep".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            vendor: "mailkeep".to_string(),
            contact: "mailkeep@users.noreply.github.com".to_string(),
        }
    }
}

/// Session setup choices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Try `COMPRESS DEFLATE` after login
    pub compress: bool,
    pub identity: ClientIdentity,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            compress: true,
            identity: ClientIdentity::default(),
        }
    }
}

/// IMAP client for Gmail over any async byte stream
pub struct GmailClient<S = TlsStream> {
    transport: CompressedTransport<S>,
    tag_counter: u32,
    selected: Option<SelectedFolder>,
}

impl GmailClient<TlsStream> {
    /// Open a TLS connection and read the greeting
    pub async fn connect(host: &str, port: u16) -> ImapResult<Self> {
        info!("Connecting to {}:{}", host, port);

        let tcp_stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ImapError::ConnectionFailed(e.to_string()))?;

        let tls_stream = TlsConnector::new()
            .connect(host, tcp_stream)
            .await
            .map_err(|e| ImapError::TlsError(e.to_string()))?;

        debug!("TLS connection established");
        Self::from_stream(tls_stream).await
    }

    /// Connect, authenticate and negotiate the session
    pub async fn establish(
        host: &str,
        port: u16,
        token: &XOAuth2Token,
        options: &ConnectOptions,
    ) -> ImapResult<Self> {
        let client = Self::connect(host, port).await?;
        client.setup(token, options).await
    }
}

impl<S> GmailClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-open stream; the server greeting is read here
    pub async fn from_stream(stream: S) -> ImapResult<Self> {
        let mut client = Self {
            transport: CompressedTransport::new(stream),
            tag_counter: 0,
            selected: None,
        };

        let greeting = client.read_item().await?;
        debug!("Greeting: {}", greeting.text);

        if greeting.text.starts_with("* BYE") {
            return Err(ImapError::Bye(greeting.text));
        }
        if !greeting.text.starts_with("* OK") && !greeting.text.starts_with("* PREAUTH") {
            return Err(ImapError::ParseError(format!(
                "Unexpected greeting: {}",
                greeting.text
            )));
        }

        Ok(client)
    }

    /// Authenticate, check for the Gmail extensions, then the optional
    /// extras (compression and identification)
    ///
    /// A missing vendor extension is fatal. Compression and `ID` failures are
    /// logged and the session continues, unless the connection itself died.
    pub async fn setup(mut self, token: &XOAuth2Token, options: &ConnectOptions) -> ImapResult<Self> {
        self.authenticate(token).await?;

        if !self.has_vendor_extensions().await? {
            return Err(ImapError::MissingVendorExtension);
        }

        if options.compress {
            match self.compress_deflate().await {
                Ok(true) => info!("COMPRESS=DEFLATE enabled"),
                Ok(false) => warn!("Server refused COMPRESS DEFLATE, continuing uncompressed"),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!("COMPRESS DEFLATE failed, continuing uncompressed: {}", e),
            }
        }

        match self.send_client_identification(&options.identity).await {
            Ok(server_id) => debug!("Server identification: {:?}", server_id),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => warn!("Client identification failed: {}", e),
        }

        Ok(self)
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{:04}", self.tag_counter)
    }

    /// Currently selected folder, if any
    pub fn selected(&self) -> Option<&SelectedFolder> {
        self.selected.as_ref()
    }

    pub fn is_compressed(&self) -> bool {
        self.transport.is_compressed()
    }

    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// SASL XOAUTH2 with the initial response inline
    pub async fn authenticate(&mut self, token: &XOAuth2Token) -> ImapResult<()> {
        let tag = self.next_tag();
        let line = format!("{} AUTHENTICATE XOAUTH2 {}\r\n", tag, token.auth_string_base64());
        debug!("C: {} AUTHENTICATE XOAUTH2 <redacted>", tag);
        self.transport.send(line.as_bytes()).await?;

        // On failure Gmail sends a base64 JSON challenge first; an empty line
        // gets us the tagged NO.
        let response = self.read_response(&tag, Some(b"\r\n")).await?;
        if response.status != Status::Ok {
            return Err(ImapError::AuthenticationFailed(response.text));
        }

        info!("XOAUTH2 authentication successful for {}", token.email());
        Ok(())
    }

    /// Query server capabilities
    pub async fn capabilities(&mut self) -> ImapResult<Vec<String>> {
        let response = self.command("CAPABILITY").await?.ok_or_failed("CAPABILITY")?;
        Ok(parse_capabilities(&response))
    }

    /// Whether the server advertises `X-GM-EXT-1`
    ///
    /// A server that refuses `CAPABILITY` cannot be checked and is a protocol
    /// failure, not a retryable command failure.
    pub async fn has_vendor_extensions(&mut self) -> ImapResult<bool> {
        let capabilities = match self.capabilities().await {
            Err(ImapError::CommandFailed { status, text, .. }) => {
                return Err(ImapError::CapabilityRefused { status, text })
            }
            result => result?,
        };
        Ok(capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(VENDOR_CAPABILITY)))
    }

    /// `ID`, returning the server's own identification as a flat word list
    pub async fn send_client_identification(
        &mut self,
        identity: &ClientIdentity,
    ) -> ImapResult<Vec<String>> {
        let command = format!(
            "ID (\"name\" {} \"version\" {} \"vendor\" {} \"contact\" {})",
            quote(&identity.name),
            quote(&identity.version),
            quote(&identity.vendor),
            quote(&identity.contact)
        );
        let response = self.command(&command).await?.ok_or_failed("ID")?;
        parse_id(&response)
    }

    /// Negotiate RFC 4978 compression; `false` when the server says no
    pub async fn compress_deflate(&mut self) -> ImapResult<bool> {
        if self.transport.is_compressed() {
            return Ok(true);
        }

        let response = self.command("COMPRESS DEFLATE").await?;
        if response.status != Status::Ok {
            debug!("COMPRESS DEFLATE refused: {}", response.text);
            return Ok(false);
        }

        self.transport.enable_compression();
        Ok(true)
    }

    /// First folder whose XLIST attributes carry `kind`'s marker
    pub async fn discover_special_folder(
        &mut self,
        kind: SpecialFolder,
    ) -> ImapResult<Option<Folder>> {
        let response = self.command("XLIST \"\" \"*\"").await?.ok_or_failed("XLIST")?;

        let folder = response
            .untagged_with("XLIST")
            .filter_map(|item| parse_list_item(item, "XLIST"))
            .find(|folder| folder.is(kind));

        match &folder {
            Some(f) => debug!("{:?} folder is {:?}", kind, f.full_path),
            None => debug!("No {:?} folder found", kind),
        }
        Ok(folder)
    }

    /// `SELECT`, or `EXAMINE` when `readonly`
    pub async fn select(&mut self, folder: &str, readonly: bool) -> ImapResult<SelectedFolder> {
        let verb = if readonly { "EXAMINE" } else { "SELECT" };
        let response = self.command(&format!("{} {}", verb, quote(folder))).await?;

        if response.status != Status::Ok {
            self.selected = None;
            return Err(ImapError::FolderNotFound(folder.to_string()));
        }

        let (uidvalidity, message_count) = parse_select(&response);
        let uidvalidity = uidvalidity.ok_or_else(|| {
            ImapError::ParseError(format!("{} {} returned no UIDVALIDITY", verb, folder))
        })?;

        let selected = SelectedFolder {
            full_path: folder.to_string(),
            uidvalidity,
            message_count,
            readonly,
        };
        info!(
            "Selected {:?}: {} messages, UIDVALIDITY {}",
            folder, message_count, uidvalidity
        );
        self.selected = Some(selected.clone());
        Ok(selected)
    }

    /// `UID SEARCH X-GM-RAW` in the selected folder, or `UID SEARCH ALL`
    pub async fn search(&mut self, query: Option<&str>) -> ImapResult<Vec<Uid>> {
        let response = match query {
            None => self.command("UID SEARCH ALL").await?,
            Some(q) if q.is_ascii() => {
                self.command(&format!("UID SEARCH X-GM-RAW {}", quote(q)))
                    .await?
            }
            Some(q) => {
                // Non-ASCII queries must travel as a UTF-8 literal
                let tag = self.next_tag();
                let line = format!(
                    "{} UID SEARCH CHARSET UTF-8 X-GM-RAW {{{}}}\r\n",
                    tag,
                    q.len()
                );
                debug!("C: {}", line.trim_end());
                self.transport.send(line.as_bytes()).await?;
                let mut literal = q.as_bytes().to_vec();
                literal.extend_from_slice(b"\r\n");
                self.read_response(&tag, Some(&literal)).await?
            }
        };

        let response = response.ok_or_failed("UID SEARCH")?;
        let uids = parse_search(&response)?;
        debug!("Search matched {} messages", uids.len());
        Ok(uids)
    }

    /// `UID FETCH` for a set of UIDs
    ///
    /// Messages come back in whatever order the server picks; FETCH items
    /// without a UID (unsolicited updates) are dropped.
    pub async fn fetch(
        &mut self,
        uids: &[Uid],
        items: FetchItems,
    ) -> ImapResult<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uid_set(uids);
        let response = self
            .command(&format!("UID FETCH {} {}", set, items.as_imap()))
            .await?
            .ok_or_failed("UID FETCH")?;

        let mut messages = Vec::with_capacity(uids.len());
        for item in response.untagged_with("FETCH") {
            if let Some(message) = parse_fetch(item)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Current Gmail labels of one message
    pub async fn get_labels(&mut self, uid: &Uid) -> ImapResult<Vec<String>> {
        let response = self
            .command(&format!("UID FETCH {} (X-GM-LABELS)", uid))
            .await?
            .ok_or_failed("UID FETCH")?;

        for item in response.untagged_with("FETCH") {
            if let Some(message) = parse_fetch(item)? {
                if &message.uid == uid {
                    return Ok(message.labels);
                }
            }
        }
        Ok(Vec::new())
    }

    /// Add labels to one message; existing labels are left alone
    pub async fn set_labels(&mut self, uid: &Uid, labels: &[String]) -> ImapResult<()> {
        if labels.is_empty() {
            return Ok(());
        }

        let args: Vec<String> = labels.iter().map(|l| label_arg(l)).collect();
        self.command(&format!("UID STORE {} +X-GM-LABELS ({})", uid, args.join(" ")))
            .await?
            .ok_or_failed("UID STORE")?;
        Ok(())
    }

    /// Upload a message; returns its new UID when the server reports one
    /// (`APPENDUID`)
    pub async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        internal_date: Option<&DateTime<FixedOffset>>,
        body: &[u8],
    ) -> ImapResult<Option<Uid>> {
        let flags: Vec<&str> = flags
            .iter()
            .map(String::as_str)
            .filter(|f| !f.eq_ignore_ascii_case("\\Recent"))
            .collect();

        let tag = self.next_tag();
        let mut line = format!("{} APPEND {} ({})", tag, quote(folder), flags.join(" "));
        if let Some(date) = internal_date {
            line.push_str(&format!(" \"{}\"", format_internal_date(date)));
        }
        line.push_str(&format!(" {{{}}}\r\n", body.len()));

        debug!("C: {}", line.trim_end());
        self.transport.send(line.as_bytes()).await?;

        let mut literal = Vec::with_capacity(body.len() + 2);
        literal.extend_from_slice(body);
        literal.extend_from_slice(b"\r\n");

        let response = self
            .read_response(&tag, Some(&literal))
            .await?
            .ok_or_failed("APPEND")?;

        let uid = parse_appenduid(&response.text);
        if uid.is_none() {
            warn!("APPEND succeeded without APPENDUID: {}", response.text);
        }
        Ok(uid)
    }

    /// End the session, logging transfer totals
    pub async fn logout(&mut self) -> ImapResult<TransportStats> {
        if let Err(e) = self.command("LOGOUT").await {
            debug!("LOGOUT did not complete cleanly: {}", e);
        }
        self.selected = None;

        let stats = self.transport.stats();
        match stats.savings_percent() {
            Some(pct) if self.transport.is_compressed() => info!(
                "Logged out: {} bytes in, {} bytes out on the wire ({}% saved by compression)",
                stats.raw_in, stats.raw_out, pct
            ),
            _ => info!(
                "Logged out: {} bytes in, {} bytes out",
                stats.raw_in, stats.raw_out
            ),
        }
        Ok(stats)
    }

    /// Send a tagged command and read through its completion
    async fn command(&mut self, command: &str) -> ImapResult<Response> {
        let tag = self.next_tag();
        debug!("C: {} {}", tag, command);
        self.transport
            .send(format!("{} {}\r\n", tag, command).as_bytes())
            .await?;
        self.read_response(&tag, None).await
    }

    /// Collect untagged items until the tagged completion for `tag`
    ///
    /// `continuation` is sent once if the server asks for more (`+`), for
    /// literal uploads and SASL exchanges.
    async fn read_response(
        &mut self,
        tag: &str,
        mut continuation: Option<&[u8]>,
    ) -> ImapResult<Response> {
        let mut untagged = Vec::new();
        let mut bye: Option<String> = None;

        loop {
            let item = match self.read_item().await {
                Ok(item) => item,
                Err(ImapError::IoError(e)) => {
                    return Err(match bye {
                        Some(text) => ImapError::Bye(text),
                        None => ImapError::IoError(e),
                    })
                }
                Err(e) => return Err(e),
            };

            if item.text.starts_with('+') {
                let data = continuation.take().ok_or_else(|| {
                    ImapError::ParseError(format!("Unexpected continuation: {}", item.text))
                })?;
                self.transport.send(data).await?;
                continue;
            }

            if item.text.starts_with("* ") {
                if item.text[2..].to_ascii_uppercase().starts_with("BYE") {
                    bye = Some(item.text[2..].to_string());
                }
                untagged.push(item);
                continue;
            }

            match parse_tagged(&item.text) {
                Some((t, status, text)) if t == tag => {
                    return Ok(Response {
                        status,
                        text: text.to_string(),
                        untagged,
                    })
                }
                _ => {
                    return Err(ImapError::ParseError(format!(
                        "Unexpected response line: {}",
                        item.text
                    )))
                }
            }
        }
    }

    /// Read one response line, pulling in any literals it announces
    async fn read_item(&mut self) -> ImapResult<ResponseItem> {
        let mut item = ResponseItem::default();
        loop {
            let raw = self.transport.read_line().await?;
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            item.text.push_str(line);

            match literal_size(line) {
                Some(size) => {
                    let literal = self.transport.read_exact(size).await?;
                    item.literals.push(literal);
                }
                None => break,
            }
        }

        if item.literals.is_empty() {
            debug!("S: {}", item.text);
        } else {
            debug!("S: {} (+{} literal(s))", item.text, item.literals.len());
        }
        Ok(item)
    }
}

/// Comma-separated UID set, e.g. `4,10,200`
fn uid_set(uids: &[Uid]) -> String {
    uids.iter()
        .map(Uid::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
