//! Conditional (`onlyIf`) precondition evaluation (spec §4.5).
//!
//! Implemented as a pure function returning a tagged result, per the
//! re-architecture note in spec §9 ("Exception-driven flow in precondition
//! evaluation... pure evaluator returning a tagged result").

use crate::object::ObjectMetadata;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtagList(pub Vec<String>);

impl EtagList {
    /// Parse a header-style value (a single etag, or a comma-separated list),
    /// trimming whitespace and surrounding quotes from each entry (spec §4.5
    /// "strings in etag lists are trimmed and stripped of surrounding quotes").
    pub fn from_header(value: &str) -> Self {
        EtagList(
            value
                .split(',')
                .map(|s| s.trim().trim_matches('"').to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, etag: &str) -> bool {
        self.0.iter().any(|e| e == etag || e == "*")
    }
}

#[derive(Debug, Clone, Default)]
pub struct OnlyIf {
    pub etag_matches: Option<EtagList>,
    pub etag_does_not_match: Option<EtagList>,
    pub uploaded_before: Option<i64>,
    pub uploaded_after: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

/// Evaluate `onlyIf` against an object's metadata (`None` if the object does not
/// exist), implementing the six-step procedure of spec §4.5 literally.
pub fn evaluate(condition: &OnlyIf, object: Option<&ObjectMetadata>) -> Verdict {
    let Some(object) = object else {
        // Step 1: with no object present, pass iff neither etagMatches nor
        // uploadedAfter is set (spec §4.5 step 1, and the Open Question in §9
        // resolving the contradiction in the source in favour of this reading).
        return if condition.etag_matches.is_none() && condition.uploaded_after.is_none() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
    };

    let etag = &object.etag;

    // Step 2: ifMatch.
    let mut if_match_matched = false;
    if let Some(ref list) = condition.etag_matches {
        if !list.contains(etag) {
            return Verdict::Fail;
        }
        if_match_matched = true;
    }

    // Step 3: ifNoneMatch.
    let mut if_none_match_matched = false;
    if let Some(ref list) = condition.etag_does_not_match {
        if list.contains(etag) {
            return Verdict::Fail;
        }
        if_none_match_matched = true;
    }

    // Step 4: if ifMatch matched, skip date checks entirely.
    if if_match_matched {
        return Verdict::Pass;
    }

    // Step 5: uploadedBefore, skipped if ifNoneMatch matched.
    if !if_none_match_matched {
        if let Some(bound) = condition.uploaded_before {
            if object.uploaded > bound {
                return Verdict::Fail;
            }
        }
    }

    // Step 6: uploadedAfter.
    if let Some(bound) = condition.uploaded_after {
        if object.uploaded < bound {
            return Verdict::Fail;
        }
    }

    Verdict::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Checksums, HttpMetadata};
    use std::collections::BTreeMap;

    fn object(etag: &str, uploaded: i64) -> ObjectMetadata {
        ObjectMetadata {
            key: "k".into(),
            version: "v".into(),
            size: 0,
            etag: etag.into(),
            http_etag: format!("\"{etag}\""),
            uploaded,
            http_metadata: HttpMetadata::default(),
            custom_metadata: BTreeMap::new(),
            checksums: Checksums::default(),
            multipart: None,
            range: None,
        }
    }

    #[test]
    fn absent_object_passes_only_without_etag_matches_or_uploaded_after() {
        assert_eq!(evaluate(&OnlyIf::default(), None), Verdict::Pass);

        let cond = OnlyIf {
            etag_matches: Some(EtagList::from_header("abc")),
            ..Default::default()
        };
        assert_eq!(evaluate(&cond, None), Verdict::Fail);

        let cond = OnlyIf {
            uploaded_after: Some(0),
            ..Default::default()
        };
        assert_eq!(evaluate(&cond, None), Verdict::Fail);

        let cond = OnlyIf {
            etag_does_not_match: Some(EtagList::from_header("abc")),
            uploaded_before: Some(100),
            ..Default::default()
        };
        assert_eq!(evaluate(&cond, None), Verdict::Pass);
    }

    #[test]
    fn etag_matches_short_circuits_date_checks() {
        let obj = object("e", 1000);
        let cond = OnlyIf {
            etag_matches: Some(EtagList::from_header("e")),
            uploaded_before: Some(0), // would otherwise fail
            ..Default::default()
        };
        assert_eq!(evaluate(&cond, Some(&obj)), Verdict::Pass);
    }

    #[test]
    fn etag_mismatch_fails() {
        let obj = object("e", 1000);
        let cond = OnlyIf {
            etag_matches: Some(EtagList::from_header("other")),
            ..Default::default()
        };
        assert_eq!(evaluate(&cond, Some(&obj)), Verdict::Fail);
    }

    #[test]
    fn none_match_skips_uploaded_before_check() {
        let obj = object("e", 1000);
        let cond = OnlyIf {
            etag_does_not_match: Some(EtagList::from_header("other")),
            uploaded_before: Some(0), // would otherwise fail, but is skipped
            ..Default::default()
        };
        assert_eq!(evaluate(&cond, Some(&obj)), Verdict::Pass);
    }
}
