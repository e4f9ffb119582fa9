//! Mapping between aggregates and transport subjects.
//!
//! An aggregate `{typ, id}` lives on subject `"<typ>.<id>"`. Parsing splits on
//! the first separator, so ids may themselves contain separators as long as
//! types do not (enforced by [`Aggregate::validate`]).

use super::types::Aggregate;
use crate::transport::matcher::TAIL_WILDCARD;
use crate::transport::{SubjectMatcher, SUBJECT_SEPARATOR};

/// Subject holding an aggregate's events.
pub fn make_subject(aggregate: &Aggregate) -> String {
    format!("{}{}{}", aggregate.typ, SUBJECT_SEPARATOR, aggregate.id)
}

/// Inverse of [`make_subject`]. `None` for subjects without a separator or
/// with an empty part.
pub fn parse_subject(subject: &str) -> Option<Aggregate> {
    let (typ, id) = subject.split_once(SUBJECT_SEPARATOR)?;
    if typ.is_empty() || id.is_empty() {
        return None;
    }
    Some(Aggregate::new(typ, id))
}

/// Pattern addressing every aggregate of a type.
pub fn type_wildcard(aggregate_type: &str) -> String {
    format!("{}{}{}", aggregate_type, SUBJECT_SEPARATOR, TAIL_WILDCARD)
}

/// Matcher selecting every aggregate of a type.
pub fn type_matcher(aggregate_type: &str) -> SubjectMatcher {
    SubjectMatcher::Pattern(type_wildcard(aggregate_type))
}
