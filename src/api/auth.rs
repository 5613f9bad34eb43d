// Bearer-token middleware for API endpoints

use actix_web::{
    body::{BoxBody, EitherBody},
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::Method,
    Error, HttpResponse,
};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};

use crate::api::models::ApiResponse;

/// Checks `Authorization: Bearer <API_SECRET>`. With no secret configured
/// every request passes.
pub struct Auth {
    secret: Option<String>,
}

impl Auth {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Auth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddleware {
            service,
            secret: self.secret.clone(),
        }))
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    secret: Option<String>,
}

fn is_public(req: &ServiceRequest) -> bool {
    *req.method() == Method::OPTIONS || matches!(req.path(), "/" | "/health")
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B, BoxBody>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let authorized = match &self.secret {
            None => true,
            Some(_) if is_public(&req) => true,
            Some(secret) => req
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.strip_prefix("Bearer "))
                .is_some_and(|token| token == secret),
        };

        if authorized {
            let fut = self.service.call(req);
            return Box::pin(async move {
                let res = fut.await?;
                Ok(res.map_into_left_body())
            });
        }

        tracing::debug!(path = %req.path(), "rejected unauthenticated request");
        Box::pin(async move {
            let response = HttpResponse::Unauthorized()
                .json(ApiResponse::<()>::error(
                    "UNAUTHORIZED",
                    "Invalid or missing authentication token",
                ))
                .map_into_right_body();
            Ok(req.into_response(response))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App};

    async fn ok() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn requires_matching_bearer_token() {
        let app = test::init_service(
            App::new()
                .wrap(Auth::new(Some("s3cret".into())))
                .route("/health", web::get().to(ok))
                .route("/api/v1/stores", web::get().to(ok)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/api/v1/stores").to_request(),
        )
        .await;
        assert_eq!(resp.status(), 401);

        let req = test::TestRequest::get()
            .uri("/api/v1/stores")
            .insert_header(("Authorization", "Bearer wrong"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::get()
            .uri("/api/v1/stores")
            .insert_header(("Authorization", "Bearer s3cret"))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }

    #[actix_web::test]
    async fn no_secret_means_open() {
        let app = test::init_service(
            App::new()
                .wrap(Auth::new(None))
                .route("/api/v1/stores", web::get().to(ok)),
        )
        .await;
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/api/v1/stores").to_request(),
        )
        .await;
        assert!(resp.status().is_success());
    }
}
