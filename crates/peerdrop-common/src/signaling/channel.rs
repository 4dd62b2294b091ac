//! Out-of-band channels for offers and answers
//!
//! Every channel exposes the same two operations: `deliver` pushes an
//! encoded signal towards the peer, `poll` checks whether the peer's signal
//! has arrived. How either happens differs per channel:
//!
//! | Channel      | deliver                         | poll                              |
//! |--------------|---------------------------------|-----------------------------------|
//! | Manual       | print armored text to copy      | read a pasted block               |
//! | URL param    | build `<base>?offer=<signal>`   | read `offer` from the page URL    |
//! | QR code      | render that URL as a QR code    | same as URL param once scanned    |
//! | Polling relay| write to a shared store key     | read the peer's key (see `relay`) |

use anyhow::{Context, Result};
use async_trait::async_trait;
use qrcode::{render::unicode, QrCode};
use std::io::{BufRead, BufReader, Stdin, Stdout, Write};
use url::Url;

use crate::core::error::SessionError;
use crate::core::negotiator::Role;
use crate::signaling::codec::{self, EncodedSignal, SignalKind};

/// Query parameter carrying the offer
pub const OFFER_PARAM: &str = "offer";

/// Maximum number of retry attempts for user input
const MAX_INPUT_RETRIES: usize = 5;

/// What `deliver` did with the signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryHandle {
    /// Shown to the user for copying.
    Displayed,
    /// Shareable link.
    Url(Url),
    /// Scannable rendering of a shareable link.
    QrCode { url: Url, image: String },
    /// Written to a shared store.
    Stored { key: String },
}

#[async_trait]
pub trait OutOfBandChannel: Send {
    async fn deliver(&mut self, signal: &EncodedSignal) -> Result<DeliveryHandle>;

    /// `Ok(None)` means nothing has arrived (yet).
    async fn poll(&mut self) -> Result<Option<EncodedSignal>>;
}

// ============================================================================
// Manual copy/paste
// ============================================================================

/// Copy/paste channel over any reader/writer pair (stdin/stdout in the CLI).
pub struct ManualChannel<R, W> {
    input: R,
    output: W,
    outgoing: SignalKind,
    incoming: SignalKind,
}

impl ManualChannel<BufReader<Stdin>, Stdout> {
    pub fn stdio(role: Role) -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout(), role)
    }
}

impl<R, W> ManualChannel<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    pub fn new(input: R, output: W, role: Role) -> Self {
        Self {
            input,
            output,
            outgoing: role.local_kind(),
            incoming: role.remote_kind(),
        }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.input, self.output)
    }

    /// Read one pasted block: everything up to the END marker, or a single
    /// bare token line. `None` at end of input.
    fn read_block(&mut self) -> Result<Option<String>> {
        let mut collected = String::new();

        loop {
            let mut line = String::new();
            let read = self
                .input
                .read_line(&mut line)
                .context("Failed to read line")?;
            if read == 0 {
                return Ok(if collected.trim().is_empty() {
                    None
                } else {
                    Some(collected)
                });
            }

            let trimmed = line.trim();
            if collected.trim().is_empty() && trimmed.is_empty() {
                continue;
            }
            let bare_token = collected.is_empty() && !trimmed.starts_with("-----");
            collected.push_str(&line);
            if bare_token || trimmed.starts_with(codec::ARMOR_END_PREFIX) {
                return Ok(Some(collected));
            }
        }
    }
}

#[async_trait]
impl<R, W> OutOfBandChannel for ManualChannel<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    async fn deliver(&mut self, signal: &EncodedSignal) -> Result<DeliveryHandle> {
        let peer = match self.outgoing {
            SignalKind::Offer => "receiver",
            SignalKind::Answer => "sender",
        };
        writeln!(self.output)?;
        writeln!(self.output, "{}", codec::armor(self.outgoing, signal))?;
        writeln!(self.output)?;
        writeln!(
            self.output,
            "Copy the code above (including BEGIN/END markers) and send it to the {}.",
            peer
        )?;
        self.output.flush().context("Failed to flush output")?;
        Ok(DeliveryHandle::Displayed)
    }

    async fn poll(&mut self) -> Result<Option<EncodedSignal>> {
        let mut retries = 0;

        loop {
            writeln!(
                self.output,
                "Paste the {}'s code (including BEGIN/END markers):",
                match self.incoming {
                    SignalKind::Offer => "sender",
                    SignalKind::Answer => "receiver",
                }
            )?;
            self.output.flush().context("Failed to flush output")?;

            let Some(block) = self.read_block()? else {
                anyhow::bail!("EOF reached while reading input");
            };

            // Decode first so a block of the wrong kind is reported as such
            let checked = codec::decode(&block).and_then(|d| {
                if d.kind != self.incoming {
                    return Err(SessionError::InvalidDescriptor(format!(
                        "expected an {}, got an {}",
                        self.incoming, d.kind
                    )));
                }
                if block.trim_start().starts_with("-----") {
                    codec::dearmor(&block, self.incoming)
                } else {
                    Ok(EncodedSignal::new(block.trim()))
                }
            });

            match checked {
                Ok(token) => return Ok(Some(token)),
                Err(err) => {
                    retries += 1;
                    if retries >= MAX_INPUT_RETRIES {
                        return Err(err).context(format!(
                            "Failed to read valid input after {} attempts",
                            MAX_INPUT_RETRIES
                        ));
                    }
                    writeln!(self.output, "{}\nPlease try again.\n", err)?;
                }
            }
        }
    }
}

// ============================================================================
// URL query parameter
// ============================================================================

/// Carries the offer in the `offer` query parameter of a link.
pub struct UrlParameterChannel {
    base_url: Url,
    page_url: Option<Url>,
    consumed: bool,
}

impl UrlParameterChannel {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            page_url: None,
            consumed: false,
        }
    }

    /// The URL this side was opened with; `poll` reads its `offer` once.
    pub fn with_page_url(mut self, page_url: Url) -> Self {
        self.page_url = Some(page_url);
        self
    }

    pub fn share_url(&self, signal: &EncodedSignal) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair(OFFER_PARAM, signal.as_str());
        url
    }
}

/// Extract the `offer` parameter from a URL, if present and non-empty.
pub fn signal_from_url(url: &Url) -> Option<EncodedSignal> {
    url.query_pairs()
        .find(|(key, value)| key == OFFER_PARAM && !value.trim().is_empty())
        .map(|(_, value)| EncodedSignal::new(value.trim()))
}

#[async_trait]
impl OutOfBandChannel for UrlParameterChannel {
    async fn deliver(&mut self, signal: &EncodedSignal) -> Result<DeliveryHandle> {
        Ok(DeliveryHandle::Url(self.share_url(signal)))
    }

    async fn poll(&mut self) -> Result<Option<EncodedSignal>> {
        if self.consumed {
            return Ok(None);
        }
        self.consumed = true;
        Ok(self.page_url.as_ref().and_then(signal_from_url))
    }
}

// ============================================================================
// QR code
// ============================================================================

/// Renders the shareable URL as a QR code. Scanning it reproduces the URL
/// parameter flow on the other device.
pub struct QrCodeChannel {
    url: UrlParameterChannel,
}

impl QrCodeChannel {
    pub fn new(url: UrlParameterChannel) -> Self {
        Self { url }
    }
}

/// Render text as a unicode QR code suitable for a terminal
pub fn render_qr(data: &str) -> Result<String> {
    let code = QrCode::new(data.as_bytes()).context("Failed to generate QR code")?;

    let image = code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build();

    Ok(image)
}

#[async_trait]
impl OutOfBandChannel for QrCodeChannel {
    async fn deliver(&mut self, signal: &EncodedSignal) -> Result<DeliveryHandle> {
        let url = self.url.share_url(signal);
        let image = render_qr(url.as_str())?;
        Ok(DeliveryHandle::QrCode { url, image })
    }

    async fn poll(&mut self) -> Result<Option<EncodedSignal>> {
        self.url.poll().await
    }
}
