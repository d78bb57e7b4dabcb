//! Message Classifier
//!
//! Deterministic intent classification and field extraction for a single
//! user message. Keyword lists decide the intent; regexes pull out the fund
//! query, amount, dates, GL-account selections and candidate choices.
//!
//! Extraction order matters: dates are found first and masked, then account
//! selections (masked too), and only then amounts, so that a date or an
//! account code is never read as money.

use crate::models::{AccountSelection, Decision, Extraction, Intent};
use chrono::NaiveDate;
use regex::{Captures, Regex};
use std::ops::Range;
use std::sync::OnceLock;

/// Static keyword lists
const CANCEL_KEYWORDS: &[&str] = &[
    "cancel", "abort", "never mind", "nevermind", "start over", "quit", "stop",
];

const CONFIRM_WORDS: &[&str] = &[
    "yes", "yep", "yeah", "confirm", "confirmed", "approve", "approved", "ok", "okay",
    "proceed", "correct", "lgtm",
];

const CONFIRM_PHRASES: &[&str] = &[
    "looks good", "go ahead", "sounds good", "all good", "that's right", "submit it",
];

const REJECT_WORDS: &[&str] = &[
    "no", "nope", "reject", "rejected", "decline", "declined", "incorrect", "wrong", "deny",
];

const REJECT_PHRASES: &[&str] = &["not correct", "not right", "do not", "don't"];

const MODIFY_KEYWORDS: &[&str] = &[
    "change", "update", "modify", "instead", "actually", "replace", "set the", "make it",
];

const LOOKUP_KEYWORDS: &[&str] = &[
    "find", "search", "look up", "lookup", "locate", "which fund", "fund",
];

const QUERY_STOPWORDS: &[&str] = &[
    "find", "search", "for", "look", "up", "lookup", "locate", "the", "use", "select", "please",
];

const ORDINALS: &[&str] = &["first", "second", "third", "fourth", "fifth"];

const AMOUNT_SUFFIX: &str = r"(million|thousand|billion|mm|mn|bn|k|m)";

/// Digits with optional thousands separators and decimals
const NUMBER: &str = r"(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)";

/// What the classifier needs to know about the thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierContext<'a> {
    pub awaiting_confirmation: bool,
    /// Number of fund candidates currently offered to the user
    pub candidate_count: usize,
    /// Name of the fund already in the data
    pub current_fund: Option<&'a str>,
}

impl ClassifierContext<'_> {
    /// Whether `query` is anything other than the chosen fund's exact name.
    fn is_new_fund(&self, query: &str) -> bool {
        self.current_fund
            .map_or(true, |name| !name.trim().eq_ignore_ascii_case(query.trim()))
    }
}

pub struct MessageClassifier;

impl MessageClassifier {
    pub fn classify(text: &str, ctx: ClassifierContext<'_>) -> Decision {
        let extraction = Self::extract(text, ctx);
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|w| !w.is_empty())
            .collect();

        let has_word = |list: &[&str]| list.iter().any(|kw| words.contains(kw));
        let has_phrase = |list: &[&str]| list.iter().any(|kw| lower.contains(*kw));

        let cancel = CANCEL_KEYWORDS
            .iter()
            .any(|kw| if kw.contains(' ') { lower.contains(*kw) } else { words.contains(kw) });
        let reject_phrase = has_phrase(REJECT_PHRASES);
        let reject = reject_phrase || has_word(REJECT_WORDS);
        let confirm = !reject_phrase && (has_word(CONFIRM_WORDS) || has_phrase(CONFIRM_PHRASES));
        let modify = has_phrase(MODIFY_KEYWORDS);
        let carries_data = extraction.has_details() || !extraction.account_selections.is_empty();

        let decision = if cancel && !carries_data {
            Decision::new(Intent::Cancel, 0.95, "cancel keyword")
        } else if ctx.awaiting_confirmation {
            let new_fund = extraction
                .fund_query
                .as_deref()
                .is_some_and(|q| ctx.is_new_fund(q));
            if extraction.candidate_choice.is_some() && !carries_data {
                Decision::new(Intent::ProvideData, 0.9, "candidate choice while awaiting confirmation")
            } else if carries_data || new_fund {
                Decision::new(Intent::ModifyData, 0.9, "new values while awaiting confirmation")
            } else if reject && confirm {
                Decision::new(Intent::AskClarification, 0.4, "both approval and rejection cues")
                    .needing_clarification("Please reply 'confirm' to proceed or 'reject' to make changes.")
            } else if reject {
                Decision::new(Intent::Reject, 0.92, "rejection keyword")
            } else if confirm {
                Decision::new(Intent::Confirm, 0.92, "approval keyword")
            } else {
                Decision::new(Intent::Unknown, 0.3, "no confirmation cue")
                    .needing_clarification("Please reply 'confirm' to proceed or 'reject' to make changes.")
            }
        } else if extraction.candidate_choice.is_some() {
            Decision::new(Intent::ProvideData, 0.9, "candidate choice")
        } else if extraction.fund_query.is_some() && (has_phrase(LOOKUP_KEYWORDS) || !carries_data) {
            Decision::new(Intent::FundLookup, 0.9, "fund reference")
        } else if carries_data && modify {
            Decision::new(Intent::ModifyData, 0.9, "modification keyword with values")
        } else if carries_data {
            Decision::new(Intent::ProvideData, 0.9, "field values present")
        } else if has_phrase(LOOKUP_KEYWORDS) && words.iter().any(|w| *w == "find" || *w == "search") {
            Decision::new(Intent::AskClarification, 0.6, "lookup without a fund name")
                .needing_clarification("Which fund should I look up?")
        } else if confirm && !reject {
            Decision::new(Intent::Confirm, 0.85, "approval keyword")
        } else if reject {
            Decision::new(Intent::Reject, 0.85, "rejection keyword")
        } else {
            Decision::new(Intent::Unknown, 0.3, "no recognised cue")
        };

        decision.with_extraction(extraction)
    }

    pub fn extract(text: &str, ctx: ClassifierContext<'_>) -> Extraction {
        let lower = text.to_lowercase();
        let mut masked = lower.clone();

        let (submit_date, posting_date, date_spans) = extract_dates(&lower);
        mask(&mut masked, &date_spans);

        let (account_selections, account_spans) = extract_accounts(&masked);
        mask(&mut masked, &account_spans);

        Extraction {
            fund_query: extract_fund_query(text),
            amount: extract_amount(&masked),
            submit_date,
            posting_date,
            account_selections,
            candidate_choice: extract_candidate_choice(&lower, ctx.candidate_count),
        }
    }
}

//
// ================= Regexes =================
//

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b")
}

fn dmy_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\b(\d{1,2})[/.](\d{1,2})[/.](\d{4})\b")
}

fn day_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"\b(\d{1,2})(?:st|nd|rd|th)?\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?,?\s+(\d{4})\b",
    )
}

fn month_day_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b",
    )
}

fn account_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\b(?:gl|accounts?|acct)\b")
}

fn account_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        &format!(
            r"^\s*(?:#|no\.?|code)?\s*:?\s*(\d{{3,6}}(?:-\d{{1,4}})?)\b(?:\s*(?::|=|->|for|with|at)?\s*\$?\s*{num}(?:\s*{suffix}\b)?)?",
            num = NUMBER,
            suffix = AMOUNT_SUFFIX
        ),
    )
}

fn account_separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^\s*(?:,|;|&|/|and)\s*(?:(?:gl|accounts?|acct)\b)?")
}

fn currency_amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        &format!(
            r"(?:\$|\busd\s*)\s*{num}(?:\s*{suffix}\b)?",
            num = NUMBER,
            suffix = AMOUNT_SUFFIX
        ),
    )
}

fn cue_amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        &format!(
            r"\b(?:amount|call(?:\s+amount)?\s+(?:of|for)|total|calling)\s*(?:is|of|:|=|to|should be)?\s*\$?\s*{num}(?:\s*{suffix}\b)?",
            num = NUMBER,
            suffix = AMOUNT_SUFFIX
        ),
    )
}

fn suffix_amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        &format!(r"\b{num}\s*{suffix}\b", num = NUMBER, suffix = AMOUNT_SUFFIX),
    )
}

fn quoted_fund_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r#"["“]([^"”]{2,80})["”]"#)
}

fn labelled_fund_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)\bfund(?:\s+name)?\s*[:=]\s*([^,.;\n]+)")
}

fn capitalized_fund_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"\b((?:[A-Z][\w&'\-]*\s+){1,6}Fund(?:\s+(?:[IVX]+|\d{1,2})\b)?)",
    )
}

fn verb_fund_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"(?i)\b(?:find|search\s+for|search|look\s+up|lookup|locate)\s+(?:the\s+)?(.+?)(?:\s+(?:and|with|to)\b|[.?!,;]|$)",
    )
}

fn choice_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(
        &RE,
        r"(?:^\s*(?:#|no\.?)?\s*(\d{1,2})\s*[.)]?\s*$|\b(?:option|choice|number|pick|select|choose)\s*#?\s*(\d{1,2})\b)",
    )
}

//
// ================= Extraction =================
//

fn mask(text: &mut String, spans: &[Range<usize>]) {
    for span in spans {
        let blank = " ".repeat(span.len());
        text.replace_range(span.clone(), &blank);
    }
}

fn extract_dates(lower: &str) -> (Option<NaiveDate>, Option<NaiveDate>, Vec<Range<usize>>) {
    let mut found: Vec<(Range<usize>, NaiveDate)> = Vec::new();

    let mut collect = |re: &Regex, build: &dyn Fn(&Captures) -> Option<NaiveDate>| {
        for caps in re.captures_iter(lower) {
            let Some(whole) = caps.get(0) else { continue };
            if found.iter().any(|(r, _)| r.start < whole.end() && whole.start() < r.end) {
                continue;
            }
            if let Some(date) = build(&caps) {
                found.push((whole.range(), date));
            }
        }
    };

    collect(iso_date_re(), &|c| {
        NaiveDate::from_ymd_opt(num(c, 1)? as i32, num(c, 2)?, num(c, 3)?)
    });
    collect(dmy_date_re(), &|c| {
        NaiveDate::from_ymd_opt(num(c, 3)? as i32, num(c, 2)?, num(c, 1)?)
    });
    collect(day_month_re(), &|c| {
        NaiveDate::from_ymd_opt(num(c, 3)? as i32, month_number(c.get(2)?.as_str())?, num(c, 1)?)
    });
    collect(month_day_re(), &|c| {
        NaiveDate::from_ymd_opt(num(c, 3)? as i32, month_number(c.get(1)?.as_str())?, num(c, 2)?)
    });

    found.sort_by_key(|(r, _)| r.start);

    let mut submit = None;
    let mut posting = None;
    let mut unlabelled = Vec::new();
    let mut previous_end = 0;

    for (range, date) in &found {
        let mut window_start = range.start.saturating_sub(24).max(previous_end);
        while !lower.is_char_boundary(window_start) {
            window_start -= 1;
        }
        let window = &lower[window_start..range.start];
        let post_at = window.rfind("post");
        let submit_at = window.rfind("submit").or_else(|| window.rfind("due"));

        match (post_at, submit_at) {
            (Some(p), Some(s)) if p > s => posting = posting.or(Some(*date)),
            (Some(_), Some(_)) => submit = submit.or(Some(*date)),
            (Some(_), None) => posting = posting.or(Some(*date)),
            (None, Some(_)) => submit = submit.or(Some(*date)),
            (None, None) => unlabelled.push(*date),
        }
        previous_end = range.end;
    }

    for date in unlabelled {
        if submit.is_none() {
            submit = Some(date);
        } else if posting.is_none() {
            posting = Some(date);
        }
    }

    let spans = found.into_iter().map(|(r, _)| r).collect();
    (submit, posting, spans)
}

fn num(caps: &Captures, index: usize) -> Option<u32> {
    caps.get(index)?.as_str().parse().ok()
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: &[&str] = &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    MONTHS
        .iter()
        .position(|m| name.starts_with(m))
        .map(|i| i as u32 + 1)
}

fn extract_accounts(text: &str) -> (Vec<AccountSelection>, Vec<Range<usize>>) {
    let mut selections: Vec<AccountSelection> = Vec::new();
    let mut spans = Vec::new();
    let mut search_from = 0;

    while let Some(keyword) = account_keyword_re().find_at(text, search_from) {
        let mut pos = keyword.end();
        let start = keyword.start();

        loop {
            let Some(caps) = account_item_re().captures(&text[pos..]) else { break };
            let Some(whole) = caps.get(0) else { break };
            let code = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let amount = caps
                .get(2)
                .and_then(|m| parse_money(m.as_str(), caps.get(3).map(|s| s.as_str())));

            match selections.iter_mut().find(|s| s.code == code) {
                Some(existing) => existing.amount = amount.or(existing.amount),
                None => selections.push(AccountSelection { code, amount }),
            }
            pos += whole.end();

            match account_separator_re().find(&text[pos..]) {
                Some(sep) if account_item_re().is_match(&text[pos + sep.end()..]) => {
                    pos += sep.end();
                }
                _ => break,
            }
        }

        if pos > keyword.end() {
            spans.push(start..pos);
        }
        search_from = pos.max(keyword.end());
    }

    (selections, spans)
}

fn extract_amount(masked: &str) -> Option<f64> {
    for re in [currency_amount_re(), cue_amount_re(), suffix_amount_re()] {
        for caps in re.captures_iter(masked) {
            let value = caps
                .get(1)
                .and_then(|m| parse_money(m.as_str(), caps.get(2).map(|s| s.as_str())));
            if let Some(v) = value {
                return Some(v);
            }
        }
    }
    None
}

/// Parse "1,250,000.50" with an optional magnitude suffix. Non-positive values are rejected.
fn parse_money(digits: &str, suffix: Option<&str>) -> Option<f64> {
    let cleaned: String = digits.chars().filter(|c| *c != ',').collect();
    let base: f64 = cleaned.parse().ok()?;
    let multiplier = match suffix {
        Some("k") | Some("thousand") => 1_000.0,
        Some("m") | Some("mm") | Some("mn") | Some("million") => 1_000_000.0,
        Some("bn") | Some("billion") => 1_000_000_000.0,
        _ => 1.0,
    };
    let value = base * multiplier;
    (value > 0.0 && value.is_finite()).then_some(value)
}

fn extract_fund_query(text: &str) -> Option<String> {
    let candidates = [
        quoted_fund_re(),
        labelled_fund_re(),
        capitalized_fund_re(),
        verb_fund_re(),
    ];

    candidates
        .iter()
        .filter_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map(|m| clean_fund_query(m.as_str()))
        .find(|q| !q.is_empty())
}

fn clean_fund_query(raw: &str) -> String {
    let mut words: Vec<&str> = raw.split_whitespace().collect();
    while let Some(first) = words.first() {
        if QUERY_STOPWORDS.contains(&first.to_lowercase().as_str()) {
            words.remove(0);
        } else {
            break;
        }
    }

    let query = words.join(" ");
    let trimmed = query.trim_matches(|c: char| !c.is_alphanumeric() && c != ')');
    match trimmed.to_lowercase().as_str() {
        "fund" | "funds" | "a fund" | "the fund" | "my fund" => String::new(),
        _ => trimmed.to_string(),
    }
}

fn extract_candidate_choice(lower: &str, candidate_count: usize) -> Option<usize> {
    if candidate_count == 0 {
        return None;
    }

    let from_number = choice_re().captures(lower).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<usize>().ok())
    });

    let choice = from_number.or_else(|| {
        if lower.len() > 40 {
            return None;
        }
        ORDINALS
            .iter()
            .position(|o| lower.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == *o))
            .map(|i| i + 1)
    })?;

    (1..=candidate_count).contains(&choice).then_some(choice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn classify(text: &str) -> Decision {
        MessageClassifier::classify(text, ClassifierContext::default())
    }

    #[test]
    fn test_fund_lookup() {
        let cases = vec![
            ("Find Evergreen Growth Fund III", "Evergreen Growth Fund III"),
            ("search for evergreen growth", "evergreen growth"),
            ("fund: Harbor Credit Opportunities", "Harbor Credit Opportunities"),
            ("I need a capital call for \"Summit Ventures\"", "Summit Ventures"),
        ];

        for (text, expected) in cases {
            let decision = classify(text);
            assert_eq!(decision.intent, Intent::FundLookup, "{}", text);
            assert_eq!(decision.extraction.fund_query.as_deref(), Some(expected), "{}", text);
        }
    }

    #[test]
    fn test_full_details_in_one_message() {
        let decision = classify(
            "Amount $2.5m, submit date 2025-03-01, posting date 15/03/2025, GL 4000: $1.5m and 4100: 1,000,000",
        );
        let ex = &decision.extraction;
        assert_eq!(decision.intent, Intent::ProvideData);
        assert_eq!(ex.amount, Some(2_500_000.0));
        assert_eq!(ex.submit_date, Some(date(2025, 3, 1)));
        assert_eq!(ex.posting_date, Some(date(2025, 3, 15)));
        assert_eq!(
            ex.account_selections,
            vec![
                AccountSelection { code: "4000".into(), amount: Some(1_500_000.0) },
                AccountSelection { code: "4100".into(), amount: Some(1_000_000.0) },
            ]
        );
    }

    #[test]
    fn test_dates_labelled_by_proximity() {
        let ex = MessageClassifier::extract(
            "post on March 20, 2025 and submit on 2025-03-05",
            ClassifierContext::default(),
        );
        assert_eq!(ex.posting_date, Some(date(2025, 3, 20)));
        assert_eq!(ex.submit_date, Some(date(2025, 3, 5)));

        let unlabelled = MessageClassifier::extract(
            "dates 2025-01-10 and 2025-01-31",
            ClassifierContext::default(),
        );
        assert_eq!(unlabelled.submit_date, Some(date(2025, 1, 10)));
        assert_eq!(unlabelled.posting_date, Some(date(2025, 1, 31)));
    }

    #[test]
    fn test_numbers_without_cue_are_not_amounts() {
        let ex = MessageClassifier::extract("use account 4000", ClassifierContext::default());
        assert_eq!(ex.amount, None);
        assert_eq!(ex.account_selections.len(), 1);

        let ex = MessageClassifier::extract("2025-03-01", ClassifierContext::default());
        assert_eq!(ex.amount, None);
    }

    #[test]
    fn test_confirmation_intents() {
        let ctx = ClassifierContext { awaiting_confirmation: true, ..Default::default() };

        assert_eq!(MessageClassifier::classify("Yes, looks good", ctx).intent, Intent::Confirm);
        assert_eq!(MessageClassifier::classify("approve", ctx).intent, Intent::Confirm);
        assert_eq!(MessageClassifier::classify("No, reject it", ctx).intent, Intent::Reject);
        assert_eq!(MessageClassifier::classify("that's not correct", ctx).intent, Intent::Reject);
        assert_eq!(
            MessageClassifier::classify("change the amount to $3m", ctx).intent,
            Intent::ModifyData
        );

        let unclear = MessageClassifier::classify("hmm", ctx);
        assert!(unclear.needs_clarification);
        assert!(!unclear.is_actionable(0.8));
    }

    #[test]
    fn test_naming_the_current_fund_still_confirms() {
        let ctx = ClassifierContext {
            awaiting_confirmation: true,
            current_fund: Some("Evergreen Growth Fund III"),
            ..Default::default()
        };

        let same = MessageClassifier::classify("Yes, go ahead with Evergreen Growth Fund III", ctx);
        assert_eq!(same.intent, Intent::Confirm);

        let other = MessageClassifier::classify("Use Harbor Credit Opportunities Fund instead", ctx);
        assert_eq!(other.intent, Intent::ModifyData);

        let broader = MessageClassifier::classify("Find Evergreen", ctx);
        assert_eq!(broader.intent, Intent::ModifyData);
    }

    #[test]
    fn test_candidate_choice_while_awaiting_confirmation() {
        let ctx = ClassifierContext {
            awaiting_confirmation: true,
            candidate_count: 2,
            current_fund: Some("Evergreen Growth Fund III"),
        };
        let decision = MessageClassifier::classify("2", ctx);
        assert_eq!(decision.intent, Intent::ProvideData);
        assert_eq!(decision.extraction.candidate_choice, Some(2));
        assert!(decision.is_actionable(0.8));
    }

    #[test]
    fn test_candidate_choice() {
        let ctx = ClassifierContext { candidate_count: 3, ..Default::default() };
        assert_eq!(MessageClassifier::extract("2", ctx).candidate_choice, Some(2));
        assert_eq!(MessageClassifier::extract("option #3", ctx).candidate_choice, Some(3));
        assert_eq!(MessageClassifier::extract("the first one", ctx).candidate_choice, Some(1));
        assert_eq!(MessageClassifier::extract("option 7", ctx).candidate_choice, None);

        let decision = MessageClassifier::classify("2", ctx);
        assert_eq!(decision.intent, Intent::ProvideData);

        let no_candidates = MessageClassifier::extract("2", ClassifierContext::default());
        assert_eq!(no_candidates.candidate_choice, None);
    }

    #[test]
    fn test_cancel_and_unknown() {
        assert_eq!(classify("cancel this please").intent, Intent::Cancel);

        let unknown = classify("hello there");
        assert_eq!(unknown.intent, Intent::Unknown);
        assert!(!unknown.is_actionable(0.8));
    }
}
