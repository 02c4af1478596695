//! RFC 5322 assembly of outbox items

use anyhow::{Context, Result};
use lettre::Message;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};

use crate::models::{Account, AttachmentRef, QueuedOutboundEmail};

fn mailbox(raw: &str) -> Result<Mailbox> {
    raw.trim()
        .parse::<Mailbox>()
        .with_context(|| format!("Invalid address: {}", raw))
}

/// Build the wire message for `item`, sent as `account`.
///
/// `attachments` pairs each reference with its file contents. Bcc
/// recipients stay in the headers: the Gmail send endpoint reads them
/// from there and strips them before delivery.
pub fn compose_message(
    account: &Account,
    item: &QueuedOutboundEmail,
    attachments: &[(AttachmentRef, Vec<u8>)],
) -> Result<Vec<u8>> {
    let from = Mailbox::new(
        account.display_name.clone(),
        account
            .email
            .parse()
            .with_context(|| format!("Invalid account address: {}", account.email))?,
    );

    let mut builder = Message::builder()
        .from(from)
        .subject(item.subject.clone())
        .keep_bcc();
    for to in &item.to {
        builder = builder.to(mailbox(to)?);
    }
    for cc in &item.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    for bcc in &item.bcc {
        builder = builder.bcc(mailbox(bcc)?);
    }

    let message = match (&item.html_body, attachments.is_empty()) {
        (None, true) => builder
            .header(ContentType::TEXT_PLAIN)
            .body(item.body.clone())?,
        (Some(html), true) => builder.multipart(MultiPart::alternative_plain_html(
            item.body.clone(),
            html.clone(),
        ))?,
        (html, false) => {
            let mut mixed = match html {
                Some(html) => MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
                    item.body.clone(),
                    html.clone(),
                )),
                None => MultiPart::mixed().singlepart(SinglePart::plain(item.body.clone())),
            };
            for (attachment, data) in attachments {
                let content_type = ContentType::parse(&attachment.mime_type)
                    .or_else(|_| ContentType::parse("application/octet-stream"))?;
                mixed = mixed.singlepart(
                    Attachment::new(attachment.filename.clone()).body(data.clone(), content_type),
                );
            }
            builder.multipart(mixed)?
        }
    };

    Ok(message.formatted())
}
