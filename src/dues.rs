use chrono::{Datelike, Local, NaiveDate};
use rand::Rng;

/// Shape check only: one `@`, non-empty local part, dotted domain. The
/// upstream data entry forms enforce nothing stronger.
pub fn is_valid_email(email: &str) -> bool {
    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty() && !tld.is_empty() && !email.contains(char::is_whitespace)
}

/// Normalize a "Dues Paid" style cell: strip the GH₵ symbol, thousands
/// separators and whitespace, then parse. A dues amount is never negative,
/// so anything below zero is rejected alongside the unparseable. None means
/// nothing usable was left; callers decide what that means (the importer
/// treats it as zero).
pub fn parse_dues_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .replace("GH₵", "")
        .replace("GHS", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| *v >= 0.0)
}

pub fn format_currency(amount: f64) -> String {
    let negative = amount < 0.0;
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = cents / 100;
    let frac = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if negative { "-" } else { "" };
    format!("GH₵ {sign}{grouped}.{frac:02}")
}

/// `CSD<year><6-digit serial>`, e.g. CSD2025004217. Collisions are possible;
/// the payment handler retries against the unique receipt_no column.
pub fn generate_receipt_number() -> String {
    let serial: u32 = rand::thread_rng().gen_range(1..=999_999);
    format!("CSD{}{:06}", Local::now().year(), serial)
}

pub fn current_academic_year() -> String {
    let year = Local::now().year();
    format!("{}-{}", year, year + 1)
}

/// Lenient date parsing for import sources; the original accepted whatever
/// its runtime's date parser could make sense of.
pub fn parse_payment_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d);
        }
    }
    None
}
