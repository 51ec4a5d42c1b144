//! Grading prompts.
//!
//! Every rubric lives here so the grading flow never has to change when a
//! rubric does, and tests can inspect prompts without a model.
//!
//! The rubric (system instruction) is chosen by [`Subject`]; the task prompt
//! adds what is specific to one document: its page count and layout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Homework subject; selects the rubric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    English,
    Chinese,
    Math,
    #[default]
    General,
}

impl Subject {
    pub const ALL: [Subject; 4] = [
        Subject::English,
        Subject::Chinese,
        Subject::Math,
        Subject::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Subject::English => "english",
            Subject::Chinese => "chinese",
            Subject::Math => "math",
            Subject::General => "general",
        }
    }

    /// Guess the subject from free text, e.g. a task prompt.
    pub fn detect(text: &str) -> Subject {
        let lower = text.to_lowercase();
        if lower.contains("english") || text.contains("英语") {
            Subject::English
        } else if lower.contains("math") || text.contains("数学") {
            Subject::Math
        } else if lower.contains("chinese") || text.contains("语文") {
            Subject::Chinese
        } else {
            Subject::General
        }
    }

    /// Rubric sent as the system instruction.
    pub fn system_prompt(self) -> &'static str {
        match self {
            Subject::English => ENGLISH_RUBRIC,
            Subject::Chinese => CHINESE_RUBRIC,
            Subject::Math => MATH_RUBRIC,
            Subject::General => GENERAL_RUBRIC,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = String;

    /// Empty input means [`Subject::General`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "english" => Ok(Subject::English),
            "chinese" => Ok(Subject::Chinese),
            "math" => Ok(Subject::Math),
            "general" | "" => Ok(Subject::General),
            other => Err(format!(
                "unknown subject '{other}' (expected english, chinese, math or general)"
            )),
        }
    }
}

/// Page layout of the scanned homework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Single,
    /// Two columns per page, often two half-size worksheets side by side.
    Double,
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "" => Ok(Layout::Single),
            "double" => Ok(Layout::Double),
            other => Err(format!("unknown layout '{other}' (expected single or double)")),
        }
    }
}

const JSON_ONLY: &str = "Reply with standard JSON only. Do not wrap it in Markdown code fences \
and do not add any explanatory text. Make sure the JSON is complete and the field names match \
the example exactly.";

const ENGLISH_RUBRIC: &str = r#"You are a professional English homework grading assistant. Analyse the student's homework and extract the handwritten answers.
Pay special attention to:
1. Handwritten answers in brackets, blanks and underlined positions
2. Telling the student's handwriting apart from the printed questions
3. Whether grammar and spelling are correct
4. Giving a short explanation and a correction for every mistake

Reply in this JSON format:
{
  "answers": [
    {
      "questionNumber": "question number",
      "studentAnswer": "the student's handwritten answer",
      "isCorrect": true,
      "correctAnswer": "the correct answer (if wrong)",
      "explanation": "short explanation"
    }
  ],
  "overallScore": "total score",
  "feedback": "overall evaluation and advice"
}"#;

const CHINESE_RUBRIC: &str = r#"You are a professional Chinese-language homework grading assistant. Analyse the student's homework and extract the handwritten answers.
Pay special attention to:
1. Handwritten answers in brackets, blanks and underlined positions
2. Telling the student's handwriting apart from the printed questions
3. Whether answers are accurate and complete, including wrong characters
4. Giving a short explanation and a suggestion for every answer

Reply in this JSON format:
{
  "answers": [
    {
      "questionNumber": "question number",
      "studentAnswer": "the student's handwritten answer",
      "isCorrect": true,
      "correctAnswer": "the correct answer (if wrong)",
      "explanation": "short explanation"
    }
  ],
  "overallScore": "total score",
  "feedback": "overall evaluation and advice"
}"#;

const MATH_RUBRIC: &str = r#"You are a professional maths homework grading assistant. Analyse the student's homework and extract the handwritten answers and working.
Pay special attention to:
1. Handwritten answers in brackets, boxes and below answer lines
2. Telling the student's handwriting apart from the printed questions
3. Formulas, intermediate steps and final answers
4. Whether each step and the final result are correct

Reply in this JSON format:
{
  "answers": [
    {
      "questionNumber": "question number",
      "studentAnswer": "the student's handwritten answer",
      "isCorrect": true,
      "correctSteps": "the correct working (if wrong)",
      "explanation": "short explanation"
    }
  ],
  "overallScore": "total score",
  "feedback": "overall evaluation and advice"
}"#;

const GENERAL_RUBRIC: &str = r#"Analyse the student's homework and extract the handwritten answers.
Pay special attention to:
1. Handwritten answers in brackets, blanks and underlined positions
2. Telling the student's handwriting apart from the printed questions

Reply in this JSON format:
{
  "answers": [
    {
      "questionNumber": "question number",
      "studentAnswer": "the student's handwritten answer",
      "evaluation": "short evaluation"
    }
  ],
  "feedback": "overall evaluation and advice"
}"#;

/// Full system instruction for a subject, including the JSON-only rule.
pub fn system_instruction(subject: Subject) -> String {
    format!("{}\n\n{}", subject.system_prompt(), JSON_ONLY)
}

/// Task prompt for one document.
///
/// `page_count` above one adds a note that the answers span several pages
/// and must be reported together.
pub fn task_prompt(
    subject: Subject,
    layout: Layout,
    student_label: &str,
    page_count: usize,
    custom: Option<&str>,
) -> String {
    let mut prompt = match custom.map(str::trim).filter(|c| !c.is_empty()) {
        Some(custom) => custom.to_string(),
        None => {
            let focus = match subject {
                Subject::Math => "brackets, boxes and space below answer lines",
                _ => "brackets, blanks and underlined positions",
            };
            let kind = match subject {
                Subject::General => "a homework assignment".to_string(),
                s => format!("{s} homework"),
            };
            format!(
                "This is {kind} from {student_label}. Read the handwritten answers carefully, \
                 especially in {focus}."
            )
        }
    };

    if layout == Layout::Double {
        prompt.push_str(
            "\n\nEach page uses a two-column layout: read the left column top to bottom, \
             then the right column.",
        );
    }
    if page_count > 1 {
        prompt.push_str(&format!(
            "\n\nThis document has {page_count} pages that all belong to the same student. \
             Grade every page and number the questions in page order in a single result."
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_parsing() {
        assert_eq!("Math".parse::<Subject>(), Ok(Subject::Math));
        assert_eq!("".parse::<Subject>(), Ok(Subject::General));
        assert!("physics".parse::<Subject>().is_err());
    }

    #[test]
    fn subject_detection_round_trips_through_prompt() {
        for subject in Subject::ALL {
            let prompt = task_prompt(subject, Layout::Single, "student 1", 1, None);
            assert_eq!(Subject::detect(&prompt), subject, "prompt: {prompt}");
        }
        assert_eq!(Subject::detect("这是一份数学作业"), Subject::Math);
    }

    #[test]
    fn rubrics_request_json_schema() {
        for subject in Subject::ALL {
            let s = system_instruction(subject);
            assert!(s.contains("\"answers\""), "{subject}");
            assert!(s.contains("code fences"), "{subject}");
        }
        assert!(MATH_RUBRIC.contains("correctSteps"));
    }

    #[test]
    fn multi_page_note_only_for_multi_page_documents() {
        let single = task_prompt(Subject::English, Layout::Single, "student 1", 1, None);
        assert!(!single.contains("pages that all belong"));
        let multi = task_prompt(Subject::English, Layout::Single, "student 1", 3, None);
        assert!(multi.contains("3 pages"));
    }

    #[test]
    fn custom_prompt_replaces_default_text() {
        let p = task_prompt(Subject::Math, Layout::Double, "x", 1, Some("Check question 4 only"));
        assert!(p.starts_with("Check question 4 only"));
        assert!(p.contains("two-column"));
    }
}
