use std::collections::BTreeMap;

use chrono::NaiveDate;
use chrono_tz::Tz;
use scraper::{Html, Selector};

use crate::date_coder::DateCoder;
use crate::fetcher::{DomSnapshot, SideChannel};
use crate::model::{Rgb, Verdict};

/// Case-insensitive substrings that, anywhere in the side channel or
/// visible page text, mean the site served an anti-bot challenge instead
/// of its calendar.
const BLOCKING_INDICATORS: &[&str] = &[
    "access denied",
    "forbidden",
    "cloudflare",
    "challenge",
    "captcha",
    "rate limit",
    "too many requests",
    "please try again",
];

/// Console noise that happens to contain a blocking word but is just CORS
/// chatter, not a real challenge page.
const CORS_INDICATORS: &[&str] = &["cors", "access-control-allow-origin"];

fn mentions_block(text: &str) -> bool {
    let lower = text.to_lowercase();
    if CORS_INDICATORS.iter().any(|c| lower.contains(c)) {
        return false;
    }
    BLOCKING_INDICATORS.iter().any(|b| lower.contains(b))
}

fn is_blocked(dom: &DomSnapshot, side: &SideChannel) -> bool {
    if mentions_block(&side.title) {
        return true;
    }
    if side.console_messages.iter().any(|m| mentions_block(m)) {
        return true;
    }

    let document = Html::parse_document(&dom.html);
    let body_text: String = document.root_element().text().collect::<Vec<_>>().join(" ");
    mentions_block(&body_text)
}

/// Parses the `background-color` declaration out of an inline `style="..."`
/// attribute into an RGB triple. Anchored specifically on the
/// `background-color` property name (not a bare `color:` or any other
/// property that happens to also use `rgb(...)`) so a date cell whose text
/// color happens to equal the palette is never mistaken for an available
/// background — see the "non-background context" boundary behavior.
/// Returns `None` if no `background-color` declaration is present.
fn extract_rgb(style: &str) -> Option<Rgb> {
    let lower = style.to_lowercase();
    let prop_start = lower.find("background-color")?;
    let rest = &lower[prop_start + "background-color".len()..];
    let rgb_start = rest.find("rgb")?;
    let rest = &rest[rgb_start..];
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let inner = &rest[open + 1..close];

    let mut parts = inner.split(',').map(str::trim);
    let r: u8 = parts.next()?.parse().ok()?;
    let g: u8 = parts.next()?.parse().ok()?;
    let b: u8 = parts.next()?.parse().ok()?;
    Some(Rgb(r, g, b))
}

/// Pure DOM -> verdict mapping. No randomness, no wall-clock reads; the
/// same `(dom, side, dates, palette, zone)` always classifies the same
/// way.
pub fn classify(
    dom: &DomSnapshot,
    side: &SideChannel,
    dates: &[NaiveDate],
    palette: Rgb,
    zone: Tz,
) -> BTreeMap<NaiveDate, Verdict> {
    let mut out = BTreeMap::new();

    if is_blocked(dom, side) {
        for &date in dates {
            out.insert(date, Verdict::Blocked);
        }
        return out;
    }

    let document = Html::parse_document(&dom.html);

    for &date in dates {
        let label = DateCoder::encode(date, zone);
        let escaped = label.replace('"', "\\\"");
        let selector_str = format!("[aria-label=\"{escaped}\"]");

        let verdict = match Selector::parse(&selector_str) {
            Ok(selector) => match document.select(&selector).next() {
                None => Verdict::NotFound,
                Some(element) => match element.value().attr("style").and_then(extract_rgb) {
                    Some(rgb) if rgb == palette => Verdict::Available,
                    _ => Verdict::Unavailable,
                },
            },
            Err(_) => Verdict::NotFound,
        };

        out.insert(date, verdict);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denver() -> Tz {
        "America/Denver".parse().unwrap()
    }

    fn dom(html: &str) -> DomSnapshot {
        DomSnapshot { html: html.to_string() }
    }

    #[test]
    fn detects_block_from_title() {
        let side = SideChannel {
            final_url: "https://example.test/".into(),
            title: "Access Denied".into(),
            console_messages: vec![],
        };
        let dates = vec![NaiveDate::from_ymd_opt(2026, 2, 14).unwrap()];
        let verdicts = classify(&dom("<html></html>"), &side, &dates, Rgb(49, 200, 25), denver());
        assert_eq!(verdicts[&dates[0]], Verdict::Blocked);
    }

    #[test]
    fn cors_noise_does_not_trigger_block() {
        let side = SideChannel {
            final_url: "https://example.test/".into(),
            title: "Book a date".into(),
            console_messages: vec!["CORS error: Access-Control-Allow-Origin missing".into()],
        };
        let date = NaiveDate::from_ymd_opt(2026, 2, 14).unwrap();
        let label = DateCoder::encode(date, denver());
        let html = format!(
            r#"<html><body><div aria-label="{label}" style="background-color: rgb(49, 200, 25);"></div></body></html>"#
        );
        let verdicts = classify(&dom(&html), &side, &[date], Rgb(49, 200, 25), denver());
        assert_eq!(verdicts[&date], Verdict::Available);
    }

    #[test]
    fn matches_available_palette() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 14).unwrap();
        let label = DateCoder::encode(date, denver());
        let html = format!(
            r#"<html><body><div aria-label="{label}" style="background-color: rgb(49, 200, 25);"></div></body></html>"#
        );
        let side = SideChannel::default();
        let verdicts = classify(&dom(&html), &side, &[date], Rgb(49, 200, 25), denver());
        assert_eq!(verdicts[&date], Verdict::Available);
    }

    #[test]
    fn different_color_is_unavailable() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 14).unwrap();
        let label = DateCoder::encode(date, denver());
        let html = format!(
            r#"<html><body><div aria-label="{label}" style="background-color: rgb(200, 49, 25);"></div></body></html>"#
        );
        let side = SideChannel::default();
        let verdicts = classify(&dom(&html), &side, &[date], Rgb(49, 200, 25), denver());
        assert_eq!(verdicts[&date], Verdict::Unavailable);
    }

    #[test]
    fn missing_element_is_not_found() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 14).unwrap();
        let side = SideChannel::default();
        let verdicts = classify(&dom("<html><body></body></html>"), &side, &[date], Rgb(49, 200, 25), denver());
        assert_eq!(verdicts[&date], Verdict::NotFound);
    }

    #[test]
    fn missing_style_is_unavailable() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 14).unwrap();
        let label = DateCoder::encode(date, denver());
        let html = format!(r#"<html><body><div aria-label="{label}"></div></body></html>"#);
        let side = SideChannel::default();
        let verdicts = classify(&dom(&html), &side, &[date], Rgb(49, 200, 25), denver());
        assert_eq!(verdicts[&date], Verdict::Unavailable);
    }

    #[test]
    fn multiple_dates_classify_independently() {
        let available = NaiveDate::from_ymd_opt(2026, 2, 14).unwrap();
        let missing = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();
        let label = DateCoder::encode(available, denver());
        let html = format!(
            r#"<html><body><div aria-label="{label}" style="background-color: rgb(49, 200, 25);"></div></body></html>"#
        );
        let side = SideChannel::default();
        let verdicts = classify(&dom(&html), &side, &[available, missing], Rgb(49, 200, 25), denver());
        assert_eq!(verdicts[&available], Verdict::Available);
        assert_eq!(verdicts[&missing], Verdict::NotFound);
    }

    #[test]
    fn extract_rgb_handles_rgba_and_whitespace() {
        assert_eq!(extract_rgb("background-color:   rgba( 49 , 200 , 25 , 1 )"), Some(Rgb(49, 200, 25)));
        assert_eq!(extract_rgb("color: blue"), None);
    }

    #[test]
    fn palette_color_in_text_color_is_not_available() {
        // The palette RGB appears as the text `color`, not the
        // `background-color` — must not classify as AVAILABLE.
        let date = NaiveDate::from_ymd_opt(2026, 2, 14).unwrap();
        let label = DateCoder::encode(date, denver());
        let html = format!(
            r#"<html><body><div aria-label="{label}" style="color: rgb(49, 200, 25); background-color: rgb(0, 0, 0);"></div></body></html>"#
        );
        let side = SideChannel::default();
        let verdicts = classify(&dom(&html), &side, &[date], Rgb(49, 200, 25), denver());
        assert_eq!(verdicts[&date], Verdict::Unavailable);
    }
}
