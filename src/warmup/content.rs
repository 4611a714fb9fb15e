//! Warmup message generation and correlation tokens.

use rand::Rng;
use rand::seq::IndexedRandom as _;
use regex::Regex;
use std::sync::OnceLock;

const TOKEN_PREFIX: &str = "WARMUP-";

const TOPICS: &[&str] = &[
    "Quick question about the roadmap",
    "Notes from this morning",
    "Following up on our chat",
    "Thoughts on the draft proposal",
    "An article worth a look",
    "Catching up later this week",
    "Small update on the project",
    "Some good news from the team",
    "Resources for Thursday",
    "Checking in",
];

const BODIES: &[&str] = &[
    "<p>Hi,</p><p>I went through the notes from last week and I think we are in good shape. \
     The open items are small and the team has them covered.</p>\
     <p>Let me know if anything else comes up.</p><p>Best,</p>",
    "<p>Hello,</p><p>I found a write-up that lines up well with what we discussed. \
     A few of the ideas could simplify the next phase.</p>\
     <p>Talk soon,</p>",
    "<p>Hi there,</p><p>Following up on our conversation. I had time to think it over and \
     I agree with the direction. Happy to jump on a short call if useful.</p><p>Thanks,</p>",
    "<p>Hello,</p><p>Just checking in on the latest changes. Progress has been steady and \
     the feedback so far is positive.</p><p>All the best,</p>",
    "<p>Hi,</p><p>Sharing a quick bit of good news: the review went well and the remaining \
     work is scheduled.</p><p>Cheers,</p>",
];

const REPLY_BODIES: &[&str] = &[
    "<p>Thanks for sending this over!</p><p>Very helpful, I will keep it in mind for our next \
     discussion.</p><p>Best regards,</p>",
    "<p>Thank you for the note.</p><p>I will read through it properly and come back to you \
     with any questions.</p><p>Have a good day,</p>",
    "<p>Appreciate it!</p><p>Looks good to me and I think we agree on next steps.</p>\
     <p>Thanks again,</p>",
];

/// Rendered warmup email, plain text and HTML alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupEmail {
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// New correlation token. Unique across restarts even when the engine's
/// random source is seeded.
pub fn generate_token() -> String {
    format!("{TOKEN_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

/// Fresh warmup email carrying `token` at the start of its subject.
pub fn compose<R: Rng>(token: &str, rng: &mut R) -> WarmupEmail {
    let topic = TOPICS.choose(rng).copied().unwrap_or("Checking in");
    let html_body = BODIES.choose(rng).copied().unwrap_or_default().to_string();
    WarmupEmail {
        subject: format!("{token}: {topic}"),
        text_body: html_to_text(&html_body),
        html_body,
    }
}

/// Reply to a warmup email. The subject keeps the token behind a `Re:` prefix,
/// which [`subject_matches_token`] refuses so replies never pass for originals.
pub fn compose_reply<R: Rng>(original_subject: &str, rng: &mut R) -> WarmupEmail {
    let html_body = REPLY_BODIES
        .choose(rng)
        .copied()
        .unwrap_or_default()
        .to_string();
    WarmupEmail {
        subject: normalize_reply_subject(original_subject),
        text_body: html_to_text(&html_body),
        html_body,
    }
}

pub fn is_reply_subject(subject: &str) -> bool {
    subject
        .trim_start()
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"))
}

/// Whether `subject` belongs to the original message identified by `token`.
pub fn subject_matches_token(subject: &str, token: &str) -> bool {
    !token.is_empty() && !is_reply_subject(subject) && subject.contains(token)
}

fn normalize_reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if is_reply_subject(subject) {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

fn html_to_text(html: &str) -> String {
    let with_breaks = html.replace("</p>", "\n\n");
    let without_tags = html_tag_regex().replace_all(&with_breaks, "");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");

    decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn html_tag_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?is)<[^>]+>").expect("valid HTML tag regex"))
}
