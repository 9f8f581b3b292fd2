use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::StoreError;
use crate::provider::vision::MealAnalysis;

/// Source tag for rows produced by photo analysis.
pub const IMAGE_DERIVED: &str = "image-derived";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MealLog {
    pub id: i64,
    pub user_id: i64,
    pub eaten_at: DateTime<Utc>,
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
    pub source: String,
    pub raw_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMealLog {
    pub user_id: i64,
    pub eaten_at: DateTime<Utc>,
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
    pub source: String,
    pub raw_json: String,
}

impl NewMealLog {
    /// Row for an analyzed photo, eaten "now".
    pub fn from_analysis(user_id: i64, analysis: &MealAnalysis, now: DateTime<Utc>) -> Result<Self, StoreError> {
        Ok(Self {
            user_id,
            eaten_at: now,
            meal_type: analysis.meal_type.clone(),
            food_name: analysis.food_name.clone(),
            description: analysis.description.clone(),
            carb_g: analysis.carb_g,
            sugar_g: analysis.sugar_g,
            protein_g: analysis.protein_g,
            fat_g: analysis.fat_g,
            veggies_servings: analysis.veggies_servings,
            fruits_servings: analysis.fruits_servings,
            calories_kcal: analysis.calories_kcal,
            source: IMAGE_DERIVED.to_string(),
            raw_json: serde_json::to_string(&analysis.raw)?,
        })
    }
}

#[derive(Clone)]
pub struct MealLogStore {
    pool: SqlitePool,
}

impl MealLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a meal. `created_at` and `updated_at` both take `eaten_at`.
    pub async fn insert(&self, meal: &NewMealLog) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO meal_logs
                 (user_id, eaten_at, meal_type, food_name, description,
                  carb_g, sugar_g, protein_g, fat_g, veggies_servings, fruits_servings, calories_kcal,
                  source, raw_json, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?2, ?2)"#,
        )
        .bind(meal.user_id)
        .bind(meal.eaten_at)
        .bind(&meal.meal_type)
        .bind(&meal.food_name)
        .bind(&meal.description)
        .bind(meal.carb_g)
        .bind(meal.sugar_g)
        .bind(meal.protein_g)
        .bind(meal.fat_g)
        .bind(meal.veggies_servings)
        .bind(meal.fruits_servings)
        .bind(meal.calories_kcal)
        .bind(&meal.source)
        .bind(&meal.raw_json)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!("Logged meal {} ({}) for user {}", id, meal.food_name, meal.user_id);
        Ok(id)
    }

    /// A user's meals, newest first.
    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<MealLog>, StoreError> {
        let meals = sqlx::query_as::<_, MealLog>(
            r#"SELECT id, user_id, eaten_at, meal_type, food_name, description,
                      carb_g, sugar_g, protein_g, fat_g, veggies_servings, fruits_servings, calories_kcal,
                      source, raw_json, created_at, updated_at
               FROM meal_logs
               WHERE user_id = ?1
               ORDER BY id DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(meals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::vision::parse_meal_analysis;
    use crate::store::Database;

    #[tokio::test]
    async fn test_insert_analysis() {
        let db = Database::in_memory().await.unwrap();
        let user = db.users().resolve_or_create("U-meal").await.unwrap();

        let analysis = parse_meal_analysis(
            r#"{"meal_type":"lunch","food_name":"雞腿便當","description":"滷雞腿配三樣青菜",
                "carb_g":"abc","sugar_g":null,"protein_g":32,"fat_g":"18.5",
                "veggies_servings":1.5,"fruits_servings":0,"calories_kcal":250,
                "advice":"青菜很棒，下次可以少一點白飯喔"}"#,
        )
        .unwrap();

        let now = Utc::now();
        let meals = db.meals();
        meals
            .insert(&NewMealLog::from_analysis(user, &analysis, now).unwrap())
            .await
            .unwrap();

        let rows = meals.list_for_user(user).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.food_name, "雞腿便當");
        assert_eq!(row.carb_g, None);
        assert_eq!(row.sugar_g, None);
        assert_eq!(row.protein_g, Some(32.0));
        assert_eq!(row.fat_g, Some(18.5));
        assert_eq!(row.fruits_servings, Some(0.0));
        assert_eq!(row.calories_kcal, Some(250.0));
        assert_eq!(row.source, IMAGE_DERIVED);
        assert_eq!(row.eaten_at, now);
        assert_eq!(row.created_at, row.updated_at);

        let raw: serde_json::Value = serde_json::from_str(&row.raw_json).unwrap();
        assert_eq!(raw["carb_g"], "abc");
    }

    #[tokio::test]
    async fn test_list_for_user_is_scoped() {
        let db = Database::in_memory().await.unwrap();
        let a = db.users().resolve_or_create("Ua").await.unwrap();
        let b = db.users().resolve_or_create("Ub").await.unwrap();

        let analysis = parse_meal_analysis(r#"{"food_name":"apple"}"#).unwrap();
        db.meals()
            .insert(&NewMealLog::from_analysis(a, &analysis, Utc::now()).unwrap())
            .await
            .unwrap();

        assert_eq!(db.meals().list_for_user(a).await.unwrap().len(), 1);
        assert!(db.meals().list_for_user(b).await.unwrap().is_empty());
    }
}
