use crate::error::GatewayError;
use crate::rules::SqlHandle;
use crate::wrapper::{ApiResponse, ApiWrapper, BodySlot};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::{Map, Value};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};

/// Executes the request body as a SQL query against the rule's pool and
/// answers the rows as a JSON array of `{column: value}` objects.
///
/// The body IS the query — there is no parameter binding. This is a
/// deliberate power-user origin: anything reaching such a rule can run
/// arbitrary SQL, so gate it behind auth transformers.
pub async fn trip(wrapper: &mut ApiWrapper) -> Result<ApiResponse, GatewayError> {
    let handle = wrapper
        .rule
        .as_ref()
        .and_then(|rule| rule.sql.clone())
        .ok_or_else(|| GatewayError::Internal("rule has no SQL pool".into()))?;

    wrapper.expand_request().await?;
    let query = wrapper
        .request
        .body
        .bytes()
        .map(|b| String::from_utf8_lossy(b).to_string())
        .unwrap_or_default();

    let rows = match &handle {
        SqlHandle::Postgres(pool) => sqlx::query(&query)
            .fetch_all(pool)
            .await
            .map(|rows| rows.iter().map(pg_row_to_json).collect::<Vec<_>>()),
        SqlHandle::MySql(pool) => sqlx::query(&query)
            .fetch_all(pool)
            .await
            .map(|rows| rows.iter().map(mysql_row_to_json).collect::<Vec<_>>()),
    }
    .map_err(|e| GatewayError::Upstream(format!("query_error: {e}")))?;

    let body = serde_json::to_vec(&rows)
        .map_err(|e| GatewayError::Internal(format!("row serialization failed: {e}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(ApiResponse::from_parts(
        StatusCode::OK,
        headers,
        BodySlot::Buffered(Bytes::from(body)),
    ))
}

/// Scalar SQL types map to their native JSON form; everything else comes
/// through as a string, or null when it cannot be decoded at all.
fn pg_row_to_json(row: &PgRow) -> Value {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(index)
                .ok()
                .flatten()
                .map(Value::Bool),
            "INT2" => number(row.try_get::<Option<i16>, _>(index).ok().flatten()),
            "INT4" => number(row.try_get::<Option<i32>, _>(index).ok().flatten()),
            "INT8" => number(row.try_get::<Option<i64>, _>(index).ok().flatten()),
            "FLOAT4" => float(row.try_get::<Option<f32>, _>(index).ok().flatten().map(f64::from)),
            "FLOAT8" => float(row.try_get::<Option<f64>, _>(index).ok().flatten()),
            "UUID" => row
                .try_get::<Option<sqlx::types::Uuid>, _>(index)
                .ok()
                .flatten()
                .map(|u| Value::String(u.to_string())),
            "TIMESTAMP" => row
                .try_get::<Option<sqlx::types::chrono::NaiveDateTime>, _>(index)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_string())),
            "TIMESTAMPTZ" => row
                .try_get::<Option<sqlx::types::chrono::DateTime<sqlx::types::chrono::Utc>>, _>(index)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_rfc3339())),
            _ => row
                .try_get::<Option<String>, _>(index)
                .ok()
                .flatten()
                .map(Value::String),
        };
        object.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}

fn mysql_row_to_json(row: &MySqlRow) -> Value {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOLEAN" => row
                .try_get::<Option<bool>, _>(index)
                .ok()
                .flatten()
                .map(Value::Bool),
            "TINYINT" => number(row.try_get::<Option<i8>, _>(index).ok().flatten()),
            "SMALLINT" => number(row.try_get::<Option<i16>, _>(index).ok().flatten()),
            "INT" | "MEDIUMINT" => number(row.try_get::<Option<i32>, _>(index).ok().flatten()),
            "BIGINT" => number(row.try_get::<Option<i64>, _>(index).ok().flatten()),
            "FLOAT" => float(row.try_get::<Option<f32>, _>(index).ok().flatten().map(f64::from)),
            "DOUBLE" => float(row.try_get::<Option<f64>, _>(index).ok().flatten()),
            "DATETIME" => row
                .try_get::<Option<sqlx::types::chrono::NaiveDateTime>, _>(index)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_string())),
            "TIMESTAMP" => row
                .try_get::<Option<sqlx::types::chrono::DateTime<sqlx::types::chrono::Utc>>, _>(index)
                .ok()
                .flatten()
                .map(|t| Value::String(t.to_rfc3339())),
            _ => row
                .try_get::<Option<String>, _>(index)
                .ok()
                .flatten()
                .map(Value::String),
        };
        object.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}

fn number<T: Into<i64>>(value: Option<T>) -> Option<Value> {
    value.map(|v| Value::Number(v.into().into()))
}

fn float(value: Option<f64>) -> Option<Value> {
    value.and_then(|v| serde_json::Number::from_f64(v).map(Value::Number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_and_float_conversion() {
        assert_eq!(number(Some(7i32)), Some(Value::Number(7.into())));
        assert_eq!(number::<i64>(None), None);
        assert_eq!(float(Some(1.5)).unwrap(), serde_json::json!(1.5));
        assert_eq!(float(Some(f64::NAN)), None);
    }
}
