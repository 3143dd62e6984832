use axum::extract::{
    rejection::{JsonRejection, QueryRejection},
    FromRequest, FromRequestParts, Json, Query, Request,
};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// `Json` whose rejection renders as an [`AppError`] body.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// `Query` whose rejection renders as an [`AppError`] body.
#[derive(Debug)]
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Paged {
        company_id: String,
        limit: Option<i64>,
    }

    #[tokio::test]
    async fn query_rejection_is_a_bad_request() {
        let request = axum::http::Request::builder()
            .uri("/api/contacts?limit=ten")
            .body(Body::empty())
            .expect("request");
        let (mut parts, _) = request.into_parts();
        let err = ApiQuery::<Paged>::from_request_parts(&mut parts, &())
            .await
            .expect_err("companyId is missing");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "bad_request");
    }

    #[tokio::test]
    async fn query_values_pass_through() {
        let request = axum::http::Request::builder()
            .uri("/api/contacts?companyId=co1&limit=10")
            .body(Body::empty())
            .expect("request");
        let (mut parts, _) = request.into_parts();
        let ApiQuery(paged) = ApiQuery::<Paged>::from_request_parts(&mut parts, &())
            .await
            .expect("valid query");
        assert_eq!(paged.company_id, "co1");
        assert_eq!(paged.limit, Some(10));
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/channels")
            .header("content-type", "application/json")
            .body(Body::from("{\"companyId\":"))
            .expect("request");
        let err = ApiJson::<serde_json::Value>::from_request(request, &())
            .await
            .expect_err("truncated body");
        assert_eq!(err.code(), "bad_request");
    }
}
