//! Meal photo analysis.

use base64::Engine;
use serde_json::Value;
use tracing::debug;

use crate::config::ModelsConfig;
use crate::error::ProviderError;
use crate::types::{CompletionRequest, ContentPart, ImageUrl, Message};

use super::CompletionProvider;

pub const MEAL_PROMPT: &str = r#"你是一位營養師助手。請看這張餐點照片，估算它的內容與營養，並只回傳一個 JSON 物件，不要附加任何說明文字。

數值請盡量給出合理估計，真的無法判斷才填 null。

{
  "meal_type": "餐別，例如 breakfast、lunch、dinner、snack",
  "food_name": "主餐名稱，例如：牛肉麵、雞腿便當",
  "description": "一到三句話描述餐點與主要食材",
  "carb_g": 碳水化合物（克，number）,
  "sugar_g": 糖（克，number）,
  "protein_g": 蛋白質（克，number）,
  "fat_g": 脂肪（克，number）,
  "veggies_servings": 蔬菜份數（number）,
  "fruits_servings": 水果份數（number）,
  "calories_kcal": 熱量（大卡，number）,
  "advice": "給使用者的一兩句溫暖飲食建議"
}"#;

/// Structured result of a meal photo.
#[derive(Debug, Clone, PartialEq)]
pub struct MealAnalysis {
    pub meal_type: String,
    pub food_name: String,
    pub description: String,
    pub carb_g: Option<f64>,
    pub sugar_g: Option<f64>,
    pub protein_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub veggies_servings: Option<f64>,
    pub fruits_servings: Option<f64>,
    pub calories_kcal: Option<f64>,
    /// Short advice for the user, when the model gave one.
    pub advice: Option<String>,
    /// The parsed object exactly as returned.
    pub raw: Value,
}

/// Ask the vision model to analyze `image` (whole JPEG/PNG bytes).
pub async fn analyze_meal(
    provider: &dyn CompletionProvider,
    models: &ModelsConfig,
    image: &[u8],
) -> Result<MealAnalysis, ProviderError> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(image);
    let request = CompletionRequest {
        messages: vec![Message::user_parts(vec![
            ContentPart::Text {
                text: MEAL_PROMPT.to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/jpeg;base64,{}", encoded),
                },
            },
        ])],
        model: models.vision_model.clone(),
        max_tokens: models.max_tokens,
        temperature: None,
        json_mode: true,
    };

    debug!(
        model = %models.vision_model,
        image_bytes = image.len(),
        "Sending meal photo for analysis"
    );
    let response = provider.complete(&request).await?;
    debug!(content_len = response.content.len(), "Meal analysis returned");

    parse_meal_analysis(&response.content)
}

/// Parse the model's answer into a [`MealAnalysis`].
pub fn parse_meal_analysis(content: &str) -> Result<MealAnalysis, ProviderError> {
    let body = strip_code_fence(content);
    let raw: Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::Parse(format!("meal JSON: {} in {:?}", e, content)))?;

    if !raw.is_object() {
        return Err(ProviderError::Parse(format!("meal JSON is not an object: {}", content)));
    }

    let advice = raw
        .get("advice")
        .and_then(|a| a.as_str())
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);

    Ok(MealAnalysis {
        meal_type: text_field(&raw, "meal_type"),
        food_name: text_field(&raw, "food_name"),
        description: text_field(&raw, "description"),
        carb_g: safe_number(raw.get("carb_g")),
        sugar_g: safe_number(raw.get("sugar_g")),
        protein_g: safe_number(raw.get("protein_g")),
        fat_g: safe_number(raw.get("fat_g")),
        veggies_servings: safe_number(raw.get("veggies_servings")),
        fruits_servings: safe_number(raw.get("fruits_servings")),
        calories_kcal: safe_number(raw.get("calories_kcal")),
        advice,
        raw,
    })
}

/// Remove a surrounding Markdown code fence (```json ... ```), if any.
pub fn strip_code_fence(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") up to the first newline.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// A finite number, from a JSON number or a numeric string.
pub fn safe_number(v: Option<&Value>) -> Option<f64> {
    let n = match v? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn text_field(raw: &Value, key: &str) -> String {
    match raw.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_coercion() {
        let a = parse_meal_analysis(r#"{"carb_g": "abc", "calories_kcal": 250}"#).unwrap();
        assert_eq!(a.carb_g, None);
        assert_eq!(a.calories_kcal, Some(250.0));
    }

    #[test]
    fn test_safe_number() {
        assert_eq!(safe_number(Some(&json!(12.5))), Some(12.5));
        assert_eq!(safe_number(Some(&json!(" 7 "))), Some(7.0));
        assert_eq!(safe_number(Some(&json!("1e2"))), Some(100.0));
        assert_eq!(safe_number(Some(&json!("NaN"))), None);
        assert_eq!(safe_number(Some(&json!("inf"))), None);
        assert_eq!(safe_number(Some(&json!(""))), None);
        assert_eq!(safe_number(Some(&json!(true))), None);
        assert_eq!(safe_number(Some(&json!([1]))), None);
        assert_eq!(safe_number(Some(&json!({"v": 1}))), None);
        assert_eq!(safe_number(Some(&Value::Null)), None);
        assert_eq!(safe_number(None), None);
    }

    #[test]
    fn test_text_fields() {
        let a = parse_meal_analysis(r#"{"meal_type": null, "food_name": 3, "description": "湯麵"}"#).unwrap();
        assert_eq!(a.meal_type, "");
        assert_eq!(a.food_name, "3");
        assert_eq!(a.description, "湯麵");
        assert!(a.advice.is_none());
    }

    #[test]
    fn test_code_fence_stripped() {
        let content = "```json\n{\"food_name\": \"牛肉麵\", \"advice\": \"記得多吃青菜\"}\n```";
        let a = parse_meal_analysis(content).unwrap();
        assert_eq!(a.food_name, "牛肉麵");
        assert_eq!(a.advice.as_deref(), Some("記得多吃青菜"));
    }

    #[test]
    fn test_strip_code_fence_variants() {
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("```{}```"), "{}");
    }

    #[test]
    fn test_raw_preserved() {
        let a = parse_meal_analysis(r#"{"carb_g": "abc", "extra": [1, 2]}"#).unwrap();
        assert_eq!(a.raw["carb_g"], "abc");
        assert_eq!(a.raw["extra"], json!([1, 2]));
    }

    #[test]
    fn test_unparseable_is_error() {
        assert!(matches!(parse_meal_analysis("I see noodles"), Err(ProviderError::Parse(_))));
        assert!(matches!(parse_meal_analysis("[1, 2]"), Err(ProviderError::Parse(_))));
    }
}
