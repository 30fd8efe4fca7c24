//! Mock download endpoint fixtures

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Serve `body` for replay `id`
pub async fn mount_replay(server: &MockServer, id: u64, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path("/api/download_file"))
        .and(query_param("id", id.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

/// Answer replay `id` with `status` (400 is what the real endpoint uses for unknown IDs)
pub async fn mount_status(server: &MockServer, id: u64, status: u16) {
    Mock::given(method("GET"))
        .and(path("/api/download_file"))
        .and(query_param("id", id.to_string()))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Fail replay `id` with a 503 for the first `times` requests, then serve `body`
pub async fn mount_flaky_replay(server: &MockServer, id: u64, times: u64, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path("/api/download_file"))
        .and(query_param("id", id.to_string()))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(times)
        .with_priority(1)
        .mount(server)
        .await;
    mount_replay(server, id, body).await;
}

/// Requests the server received for replay `id`
pub async fn requests_for(server: &MockServer, id: u64) -> usize {
    let needle = format!("id={}", id);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.query() == Some(needle.as_str()))
        .count()
}
