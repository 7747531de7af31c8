use lazy_regex::regex;
use time::{Date, Month};
use time_tz::{timezones, OffsetDateTimeExt};

/// How an ambiguous `a/b/YYYY` date is read. The portals are
/// locale-consistent within themselves, so the order is fixed per adapter
/// rather than guessed from content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOrder {
    DayFirst,
    MonthFirst,
}

/// Current date at the retailers' portals (Asia/Jerusalem).
pub fn today() -> Date {
    time::OffsetDateTime::now_utc()
        .to_timezone(timezones::db::asia::JERUSALEM)
        .date()
}

fn build_date(year: i32, month: u32, day: u32) -> Option<Date> {
    let month = Month::try_from(u8::try_from(month).ok()?).ok()?;
    Date::from_calendar_date(year, month, u8::try_from(day).ok()?).ok()
}

fn capture_u32(caps: &regex::Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx)?.as_str().parse().ok()
}

fn capture_i32(caps: &regex::Captures<'_>, idx: usize) -> Option<i32> {
    caps.get(idx)?.as_str().parse().ok()
}

/// Pull a calendar date out of free text (a URL, link text or table cell).
///
/// Formats tried in order: `YYYY-MM-DD`, `DD-MM-YYYY`, `YYYYMMDD`,
/// `a/b/YYYY` (read per `order`), `YYYY/MM/DD`, `DD.MM.YYYY`. Returns
/// `None` when nothing parses to a real date.
pub fn extract_date(text: &str, order: DateOrder) -> Option<Date> {
    if let Some(caps) = regex!(r"(\d{4})-(\d{2})-(\d{2})").captures(text) {
        if let Some(d) = build_date(
            capture_i32(&caps, 1)?,
            capture_u32(&caps, 2)?,
            capture_u32(&caps, 3)?,
        ) {
            return Some(d);
        }
    }
    if let Some(caps) = regex!(r"(\d{2})-(\d{2})-(\d{4})").captures(text) {
        if let Some(d) = build_date(
            capture_i32(&caps, 3)?,
            capture_u32(&caps, 2)?,
            capture_u32(&caps, 1)?,
        ) {
            return Some(d);
        }
    }
    if let Some(caps) = regex!(r"(?:^|\D)(\d{4})(\d{2})(\d{2})(?:\D|$)").captures(text) {
        if let Some(d) = build_date(
            capture_i32(&caps, 1)?,
            capture_u32(&caps, 2)?,
            capture_u32(&caps, 3)?,
        ) {
            return Some(d);
        }
    }
    if let Some(caps) = regex!(r"(\d{1,2})/(\d{1,2})/(\d{4})").captures(text) {
        let (a, b) = (capture_u32(&caps, 1)?, capture_u32(&caps, 2)?);
        let year = capture_i32(&caps, 3)?;
        let (day, month) = match order {
            DateOrder::DayFirst => (a, b),
            DateOrder::MonthFirst => (b, a),
        };
        if let Some(d) = build_date(year, month, day) {
            return Some(d);
        }
    }
    if let Some(caps) = regex!(r"(\d{4})/(\d{2})/(\d{2})").captures(text) {
        if let Some(d) = build_date(
            capture_i32(&caps, 1)?,
            capture_u32(&caps, 2)?,
            capture_u32(&caps, 3)?,
        ) {
            return Some(d);
        }
    }
    if let Some(caps) = regex!(r"(\d{2})\.(\d{2})\.(\d{4})").captures(text) {
        if let Some(d) = build_date(
            capture_i32(&caps, 3)?,
            capture_u32(&caps, 2)?,
            capture_u32(&caps, 1)?,
        ) {
            return Some(d);
        }
    }
    None
}

/// Extract a date from a link, preferring the URL over the visible text.
pub fn extract_date_from_link(href: &str, link_text: &str, order: DateOrder) -> Option<Date> {
    extract_date(href, order).or_else(|| extract_date(link_text, order))
}

/// Conservative today-filter: entries without an extractable date never
/// match, so stale or undateable files are not re-ingested.
pub fn is_today(date: Option<Date>, today: Date) -> bool {
    date == Some(today)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn parses_iso_dates() {
        assert_eq!(
            Some(date!(2025 - 01 - 14)),
            extract_date("prices-2025-01-14.gz", DateOrder::DayFirst)
        );
    }

    #[test]
    fn parses_compact_dates() {
        assert_eq!(
            Some(date!(2025 - 01 - 14)),
            extract_date("PriceFull-20250114.gz", DateOrder::DayFirst)
        );
    }

    #[test]
    fn slash_order_is_adapter_controlled() {
        assert_eq!(
            Some(date!(2025 - 03 - 04)),
            extract_date("04/03/2025 01:24", DateOrder::DayFirst)
        );
        assert_eq!(
            Some(date!(2025 - 04 - 03)),
            extract_date("04/03/2025 01:24", DateOrder::MonthFirst)
        );
    }

    #[test]
    fn parses_dotted_and_dashed_dates() {
        assert_eq!(
            Some(date!(2024 - 12 - 31)),
            extract_date("31.12.2024", DateOrder::DayFirst)
        );
        assert_eq!(
            Some(date!(2024 - 12 - 31)),
            extract_date("31-12-2024", DateOrder::DayFirst)
        );
        assert_eq!(
            Some(date!(2024 - 12 - 31)),
            extract_date("2024/12/31", DateOrder::DayFirst)
        );
    }

    #[test]
    fn rejects_impossible_dates() {
        assert_eq!(None, extract_date("no digits here", DateOrder::DayFirst));
        assert_eq!(None, extract_date("99/99/2025", DateOrder::DayFirst));
    }

    #[test]
    fn link_text_is_a_fallback() {
        assert_eq!(
            Some(date!(2025 - 01 - 14)),
            extract_date_from_link("/files/42", "prices 2025-01-14", DateOrder::DayFirst)
        );
    }

    #[test]
    fn undateable_entries_never_match_today() {
        let today = date!(2025 - 01 - 14);
        assert!(is_today(Some(today), today));
        assert!(!is_today(Some(date!(2025 - 01 - 13)), today));
        assert!(!is_today(None, today));
    }
}
