//! Conversation State - entities mentioned across the turns of a session
//!
//! Sequences are append-only and duplicate-free, ordered by first mention.
//! The last element of a sequence is the "most recent" value used to
//! resolve vague references such as "that lecturer".

use serde::{Deserialize, Serialize};

/// Entity category tracked by the conversation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Course,
    Lecturer,
    Year,
    Semester,
}

/// Entities explicitly mentioned in one turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntities {
    #[serde(default, alias = "course")]
    pub courses: Vec<String>,

    #[serde(default, alias = "lecturer")]
    pub lecturers: Vec<String>,

    #[serde(default)]
    pub years: Vec<i32>,

    #[serde(default)]
    pub semesters: Vec<String>,
}

impl ExtractedEntities {
    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
            && self.lecturers.is_empty()
            && self.years.is_empty()
            && self.semesters.is_empty()
    }

    /// True when some category names two or more distinct values
    pub fn has_multiple_of_a_kind(&self) -> bool {
        distinct_count(&self.courses) > 1
            || distinct_count(&self.lecturers) > 1
            || distinct_count(&self.years) > 1
            || distinct_count(&self.semesters) > 1
    }
}

fn distinct_count<T: PartialEq>(values: &[T]) -> usize {
    let mut seen: Vec<&T> = Vec::with_capacity(values.len());
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen.len()
}

/// Accumulated entities for one session.
///
/// Passed into and returned from each turn; persistence is the caller's
/// concern. Fields are private so `update` is the only mutation path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationState {
    courses: Vec<String>,
    lecturers: Vec<String>,
    years: Vec<i32>,
    semesters: Vec<String>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge newly extracted entities, skipping values already present.
    ///
    /// Idempotent: applying the same input twice leaves the state as one
    /// application did.
    pub fn update(&mut self, extracted: &ExtractedEntities) {
        append_new(&mut self.courses, &extracted.courses);
        append_new(&mut self.lecturers, &extracted.lecturers);
        append_new(&mut self.years, &extracted.years);
        append_new(&mut self.semesters, &extracted.semesters);
    }

    pub fn courses(&self) -> &[String] {
        &self.courses
    }

    pub fn lecturers(&self) -> &[String] {
        &self.lecturers
    }

    pub fn years(&self) -> &[i32] {
        &self.years
    }

    pub fn semesters(&self) -> &[String] {
        &self.semesters
    }

    pub fn most_recent_course(&self) -> Option<&str> {
        self.courses.last().map(String::as_str)
    }

    pub fn most_recent_lecturer(&self) -> Option<&str> {
        self.lecturers.last().map(String::as_str)
    }

    pub fn most_recent_year(&self) -> Option<i32> {
        self.years.last().copied()
    }

    pub fn most_recent_semester(&self) -> Option<&str> {
        self.semesters.last().map(String::as_str)
    }

    /// Most recent value of any category, rendered as text
    pub fn most_recent(&self, kind: EntityKind) -> Option<String> {
        match kind {
            EntityKind::Course => self.most_recent_course().map(str::to_string),
            EntityKind::Lecturer => self.most_recent_lecturer().map(str::to_string),
            EntityKind::Year => self.most_recent_year().map(|y| y.to_string()),
            EntityKind::Semester => self.most_recent_semester().map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
            && self.lecturers.is_empty()
            && self.years.is_empty()
            && self.semesters.is_empty()
    }

    /// Textual summary for language-model prompts
    pub fn render_context(&self) -> String {
        let years: Vec<String> = self.years.iter().map(|y| y.to_string()).collect();

        let mut out = String::new();
        push_category(&mut out, "Courses", "course", &self.courses);
        push_category(&mut out, "Lecturers", "lecturer", &self.lecturers);
        push_category(&mut out, "Years", "year", &years);
        push_category(&mut out, "Semesters", "semester", &self.semesters);
        out
    }
}

fn append_new<T: PartialEq + Clone>(target: &mut Vec<T>, incoming: &[T]) {
    for value in incoming {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

fn push_category(out: &mut String, plural: &str, singular: &str, values: &[String]) {
    let quoted: Vec<String> = values.iter().map(|v| format!("\"{}\"", v)).collect();
    out.push_str(&format!(
        "{} mentioned in conversation: [{}]\n",
        plural,
        quoted.join(", ")
    ));
    out.push_str(&format!(
        "Most recent {} (used for vague references): {}\n",
        singular,
        values.last().map(String::as_str).unwrap_or("None")
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(courses: &[&str], lecturers: &[&str]) -> ExtractedEntities {
        ExtractedEntities {
            courses: courses.iter().map(|s| s.to_string()).collect(),
            lecturers: lecturers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_update_is_idempotent() {
        let e = ExtractedEntities {
            years: vec![2023],
            ..entities(&["Algorithms"], &["Dana Keren"])
        };

        let mut once = ConversationState::new();
        once.update(&e);

        let mut twice = ConversationState::new();
        twice.update(&e);
        twice.update(&e);

        assert_eq!(once, twice);
        assert_eq!(twice.courses(), ["Algorithms"]);
    }

    #[test]
    fn test_first_mention_order_and_most_recent() {
        let mut state = ConversationState::new();
        state.update(&entities(&["Algorithms"], &["A"]));
        state.update(&entities(&["Data Structures", "Algorithms"], &["B"]));
        state.update(&entities(&[], &["A"]));

        assert_eq!(state.courses(), ["Algorithms", "Data Structures"]);
        assert_eq!(state.lecturers(), ["A", "B"]);
        // re-mentioning "A" does not reorder
        assert_eq!(state.most_recent_lecturer(), Some("B"));
        assert_eq!(state.most_recent(EntityKind::Course).as_deref(), Some("Data Structures"));
        assert_eq!(state.most_recent(EntityKind::Year), None);
    }

    #[test]
    fn test_render_context() {
        let mut state = ConversationState::new();
        state.update(&entities(&["Algorithms"], &["A"]));

        let rendered = state.render_context();
        assert!(rendered.contains("Courses mentioned in conversation: [\"Algorithms\"]"));
        assert!(rendered.contains("Most recent lecturer (used for vague references): A"));
        assert!(rendered.contains("Most recent year (used for vague references): None"));
    }

    #[test]
    fn test_multiple_of_a_kind() {
        assert!(!entities(&["Algorithms"], &["A"]).has_multiple_of_a_kind());
        assert!(entities(&["X"], &["A", "B"]).has_multiple_of_a_kind());
        assert!(!entities(&[], &["A", "A"]).has_multiple_of_a_kind());
    }

    #[test]
    fn test_state_round_trips_through_transport() {
        let mut state = ConversationState::new();
        state.update(&entities(&["Algorithms"], &[]));
        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);

        let empty: ConversationState = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }
}
