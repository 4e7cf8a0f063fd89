//! `reqwest` implementation of [`RemoteGateway`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use libris_api_types::{
    AuthorStats, Book, BookCreateRequest, BookFilterOptions, BookId, BookUpdateRequest, Category,
    CategoryId, CategoryStats, DownloadHistory, MessageResponse, PageResponse, PlatformStats,
    Recommendation, Tag, User, UserActivityStats,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::application::session::Session;

use super::{BookQuery, GatewayError, RecommendationRequest, RemoteGateway, Upload};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base: Url,
    session: Arc<Session>,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration, session: Arc<Session>) -> Result<Self, GatewayError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::invalid_request(err.to_string()))?;
        Ok(Self {
            client,
            base,
            session,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("libris-sync/", env!("CARGO_PKG_VERSION"))
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, GatewayError> {
        let mut url = self.base.join(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<RequestBuilder, GatewayError> {
        let url = self.url(path, query)?;
        let builder = self.client.request(method, url);
        Ok(match self.session.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Bytes, GatewayError> {
        let started = Instant::now();
        let response = builder.send().await?;
        self.check(response, started).await
    }

    async fn check(&self, response: Response, started: Instant) -> Result<Bytes, GatewayError> {
        let status = response.status();
        let url = response.url().path().to_string();
        let bytes = response.bytes().await?;
        debug!(
            path = %url,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Gateway call completed"
        );
        if status.is_success() {
            return Ok(bytes);
        }

        let error = GatewayError::from_status(status.as_u16(), &bytes);
        if error.is_unauthorized() {
            self.session.mark_unauthorized();
        }
        Err(error)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let bytes = self.send(self.request(Method::GET, path, query)?).await?;
        decode(&bytes)
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
    ) -> Result<T, GatewayError> {
        let bytes = self.send(self.request(method, path, &[])?).await?;
        decode(&bytes)
    }

    async fn send_book_form<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        book: &T,
        file: Option<Upload>,
    ) -> Result<Book, GatewayError> {
        let json = serde_json::to_string(book)
            .map_err(|err| GatewayError::invalid_request(err.to_string()))?;
        let book_part = Part::text(json)
            .mime_str("application/json")
            .map_err(|err| GatewayError::invalid_request(err.to_string()))?;
        let mut form = Form::new().part("book", book_part);
        if let Some(file) = file {
            form = form.part("file", file_part(file)?);
        }
        let bytes = self
            .send(self.request(method, path, &[])?.multipart(form))
            .await?;
        decode(&bytes)
    }

    async fn upload(&self, path: &str, file: Upload) -> Result<MessageResponse, GatewayError> {
        let form = Form::new().part("file", file_part(file)?);
        let bytes = self
            .send(self.request(Method::POST, path, &[])?.multipart(form))
            .await?;
        decode(&bytes)
    }
}

fn file_part(file: Upload) -> Result<Part, GatewayError> {
    Part::bytes(file.bytes.to_vec())
        .file_name(file.file_name)
        .mime_str(&file.content_type)
        .map_err(|err| GatewayError::invalid_request(err.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(bytes).map_err(|err| GatewayError::decode(err.to_string()))
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn list_books(&self, query: &BookQuery) -> Result<PageResponse<Book>, GatewayError> {
        self.get_json("books", &query.to_pairs()).await
    }

    async fn search_books(&self, query: &BookQuery) -> Result<PageResponse<Book>, GatewayError> {
        self.get_json("books/search", &query.to_pairs()).await
    }

    async fn get_book(&self, id: BookId) -> Result<Book, GatewayError> {
        self.get_json(&format!("books/{id}"), &[]).await
    }

    async fn books_by_category(
        &self,
        category_id: CategoryId,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<Book>, GatewayError> {
        self.get_json(
            &format!("books/category/{category_id}"),
            &[("page", page.to_string()), ("size", size.to_string())],
        )
        .await
    }

    async fn book_filters(&self) -> Result<BookFilterOptions, GatewayError> {
        self.get_json("books/filters", &[]).await
    }

    async fn create_book(
        &self,
        request: &BookCreateRequest,
        file: Option<Upload>,
    ) -> Result<Book, GatewayError> {
        self.send_book_form(Method::POST, "books", request, file).await
    }

    async fn update_book(
        &self,
        id: BookId,
        request: &BookUpdateRequest,
        file: Option<Upload>,
    ) -> Result<Book, GatewayError> {
        self.send_book_form(Method::PUT, &format!("books/{id}"), request, file)
            .await
    }

    async fn delete_book(&self, id: BookId) -> Result<(), GatewayError> {
        self.send(self.request(Method::DELETE, &format!("books/{id}"), &[])?)
            .await
            .map(|_| ())
    }

    async fn upload_book_pdf(
        &self,
        id: BookId,
        file: Upload,
    ) -> Result<MessageResponse, GatewayError> {
        self.upload(&format!("books/{id}/upload-pdf"), file).await
    }

    async fn upload_book_cover(
        &self,
        id: BookId,
        file: Upload,
    ) -> Result<MessageResponse, GatewayError> {
        self.upload(&format!("books/{id}/upload-cover"), file).await
    }

    async fn categories(&self) -> Result<Vec<Category>, GatewayError> {
        self.get_json("categories", &[]).await
    }

    async fn tags(&self) -> Result<Vec<Tag>, GatewayError> {
        self.get_json("tags", &[]).await
    }

    async fn favorites(&self) -> Result<Vec<Book>, GatewayError> {
        self.get_json("users/favorites", &[]).await
    }

    async fn add_favorite(&self, id: BookId) -> Result<MessageResponse, GatewayError> {
        self.call_json(Method::POST, &format!("users/favorites/{id}"))
            .await
    }

    async fn remove_favorite(&self, id: BookId) -> Result<MessageResponse, GatewayError> {
        self.call_json(Method::DELETE, &format!("users/favorites/{id}"))
            .await
    }

    async fn downloads(
        &self,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<DownloadHistory>, GatewayError> {
        self.get_json(
            "users/downloads",
            &[("page", page.to_string()), ("size", size.to_string())],
        )
        .await
    }

    async fn recommendations(
        &self,
        request: RecommendationRequest,
    ) -> Result<Vec<Recommendation>, GatewayError> {
        self.get_json(&request.path(), &[("limit", request.limit().to_string())])
            .await
    }

    async fn platform_stats(&self) -> Result<PlatformStats, GatewayError> {
        self.get_json("analytics/platform", &[]).await
    }

    async fn category_stats(&self) -> Result<Vec<CategoryStats>, GatewayError> {
        self.get_json("analytics/categories", &[]).await
    }

    async fn popular_authors(&self, limit: u32) -> Result<Vec<AuthorStats>, GatewayError> {
        self.get_json("analytics/authors/popular", &[("limit", limit.to_string())])
            .await
    }

    async fn active_users(
        &self,
        days: u32,
        limit: u32,
    ) -> Result<Vec<UserActivityStats>, GatewayError> {
        self.get_json(
            "analytics/users/active",
            &[("days", days.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn profile(&self) -> Result<User, GatewayError> {
        self.get_json("users/profile", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;

    fn gateway(server: &MockServer, session: Arc<Session>) -> HttpGateway {
        HttpGateway::new(&server.url("/api"), DEFAULT_TIMEOUT, session).expect("gateway")
    }

    const BOOK_JSON: &str = r#"{"id":42,"title":"Dune","author":"Frank Herbert","categoryId":2,"categoryName":"Science Fiction","downloadCount":3,"favoriteCount":1,"available":true,"tagNames":["sf"],"createdAt":"2024-01-01T10:00:00","updatedAt":"2024-01-01T10:00:00"}"#;

    #[tokio::test]
    async fn get_book_sends_bearer_token() -> Result<(), GatewayError> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET")
                .path("/api/books/42")
                .header("authorization", "Bearer secret");
            then.status(200)
                .header("content-type", "application/json")
                .body(BOOK_JSON);
        });

        let gateway = gateway(&server, Arc::new(Session::with_token("secret")));
        let book = gateway.get_book(42).await?;
        mock.assert();
        assert_eq!(book.title, "Dune");
        Ok(())
    }

    #[tokio::test]
    async fn list_books_passes_paging_and_filters() -> Result<(), GatewayError> {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET")
                .path("/api/books")
                .query_param("page", "1")
                .query_param("size", "24")
                .query_param("sortBy", "title")
                .query_param("sortDir", "asc")
                .query_param("categoryId", "2");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"content":[],"totalElements":0,"totalPages":0,"number":1,"size":24}"#);
        });

        let gateway = gateway(&server, Arc::new(Session::new()));
        let query = BookQuery {
            category_id: Some(2),
            sort_by: libris_api_types::SortField::Title,
            sort_dir: libris_api_types::SortDir::Asc,
            page: 1,
            size: 24,
            ..Default::default()
        };
        let page = gateway.list_books(&query).await?;
        mock.assert();
        assert_eq!(page.number, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_clears_session_and_notifies() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/api/users/favorites");
            then.status(401);
        });

        let session = Arc::new(Session::with_token("stale"));
        let gateway = gateway(&server, session.clone());
        let rx = session.subscribe();

        let err = gateway.favorites().await.expect_err("401 should fail");

        mock.assert();
        assert!(err.is_unauthorized());
        assert!(session.token().is_none());
        assert!(!session.mark_unauthorized());
        assert_eq!(
            *rx.borrow(),
            crate::application::session::SessionEvent::Expired
        );
    }

    #[tokio::test]
    async fn validation_error_surfaces_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/api/books");
            then.status(400)
                .header("content-type", "application/json")
                .body(r#"{"message":"Title is required","field":"title"}"#);
        });

        let gateway = gateway(&server, Arc::new(Session::with_token("t")));
        let request = BookCreateRequest {
            title: String::new(),
            author: "Anon".to_string(),
            isbn: None,
            description: None,
            publication_year: None,
            page_count: None,
            language: None,
            category_id: 1,
            tag_names: Vec::new(),
        };
        let err = gateway
            .create_book(&request, None)
            .await
            .expect_err("400 should fail");
        assert_eq!(err, GatewayError::validation("Title is required", Some("title")));
    }

    #[tokio::test]
    async fn unreachable_backend_is_network_error() {
        let gateway = HttpGateway::new(
            "http://127.0.0.1:9/api",
            Duration::from_millis(500),
            Arc::new(Session::new()),
        )
        .expect("gateway");
        let err = gateway.categories().await.expect_err("nothing listens");
        assert!(err.is_retryable());
    }
}
