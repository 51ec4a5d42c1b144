//! The grading result schema returned by the model.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The model's verdict for one student document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingResult {
    pub answers: Vec<Answer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_score: Option<Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// One graded question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    #[serde(deserialize_with = "text_or_number")]
    pub question_number: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub student_answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_steps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Models report scores as `"85"`, `"85/100"` or `85`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    Number(f64),
    Text(String),
}

/// Accept strings, numbers and null where the schema says string.
fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl GradingResult {
    /// `(correct, judged)`: answers marked correct, and answers with any
    /// correctness verdict at all.
    pub fn tally(&self) -> (usize, usize) {
        let judged = self.answers.iter().filter(|a| a.is_correct.is_some()).count();
        let correct = self
            .answers
            .iter()
            .filter(|a| a.is_correct == Some(true))
            .count();
        (correct, judged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_are_accepted() {
        let r: GradingResult = serde_json::from_str(
            r#"{"answers":[{"questionNumber":3,"studentAnswer":42,"isCorrect":true}],"overallScore":90}"#,
        )
        .unwrap();
        assert_eq!(r.answers[0].question_number, "3");
        assert_eq!(r.answers[0].student_answer, "42");
        assert_eq!(r.overall_score, Some(Score::Number(90.0)));
    }

    #[test]
    fn answers_are_required() {
        assert!(serde_json::from_str::<GradingResult>(r#"{"feedback":"ok"}"#).is_err());
    }

    #[test]
    fn serialises_camel_case_without_empty_fields() {
        let r: GradingResult = serde_json::from_str(
            r#"{"answers":[{"questionNumber":"1","studentAnswer":"a","evaluation":"fine"}]}"#,
        )
        .unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"questionNumber\":\"1\""));
        assert!(!json.contains("isCorrect"));
        assert!(!json.contains("overallScore"));
    }

    #[test]
    fn tally_counts_verdicts() {
        let r: GradingResult = serde_json::from_str(
            r#"{"answers":[
                {"questionNumber":"1","isCorrect":true},
                {"questionNumber":"2","isCorrect":false},
                {"questionNumber":"3"}]}"#,
        )
        .unwrap();
        assert_eq!(r.tally(), (1, 2));
    }
}
