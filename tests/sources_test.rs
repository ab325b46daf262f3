//! Gmail and Drive sources against an in-process stand-in for the Google APIs

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use casebook::connections::ServiceName;
use casebook::jobs::{DateRange, ProjectScope};
use casebook::sources::{drive_query, gmail_query, DataSource, DriveSource, GmailSource, SourceError};

const TOKEN: &str = "ya29.good";

/// One request as the stand-in saw it
#[derive(Debug, Clone)]
struct Seen {
    path: String,
    query: HashMap<String, String>,
    authorization: String,
}

fn answer(req: &Request<Incoming>) -> (StatusCode, String) {
    let expected = format!("Bearer {}", TOKEN);
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, r#"{"error":{"code":401}}"#.into());
    }

    match req.uri().path() {
        "/gmail/v1/users/me/messages" => (
            StatusCode::OK,
            r#"{"messages":[{"id":"m1","threadId":"t1"},{"id":"m2","threadId":"t1"}],"resultSizeEstimate":27}"#.into(),
        ),
        "/gmail/v1/users/me/messages/m1" => (
            StatusCode::OK,
            r#"{"id":"m1","payload":{"headers":[{"name":"Subject","value":"Checkout kickoff"}]}}"#.into(),
        ),
        "/gmail/v1/users/me/messages/m2" => (StatusCode::INTERNAL_SERVER_ERROR, "{}".into()),
        "/drive/v3/files" => (
            StatusCode::OK,
            r#"{"files":[{"id":"f1","name":"Checkout plan","mimeType":"application/vnd.google-apps.document"}]}"#.into(),
        ),
        _ => (StatusCode::NOT_FOUND, "{}".into()),
    }
}

async fn google_stand_in() -> (String, Arc<Mutex<Vec<Seen>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let log = Arc::clone(&log);
                    async move {
                        log.lock().unwrap().push(Seen {
                            path: req.uri().path().to_string(),
                            query: serde_urlencoded::from_str(req.uri().query().unwrap_or(""))
                                .unwrap(),
                            authorization: req
                                .headers()
                                .get("authorization")
                                .map(|v| v.to_str().unwrap().to_string())
                                .unwrap_or_default(),
                        });
                        let (status, body) = answer(&req);
                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        *response.status_mut() = status;
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (base, seen)
}

fn scope() -> ProjectScope {
    let end = Utc::now();
    ProjectScope {
        project_name: "Checkout redesign".into(),
        date_range: DateRange {
            start: end - ChronoDuration::days(30),
            end,
        },
        participants: vec!["ana@example.com".into()],
        keywords: vec!["checkout".into()],
        source_reference: None,
    }
}

#[tokio::test]
async fn gmail_sample_searches_with_scope_query() {
    let (base, seen) = google_stand_in().await;
    let gmail = GmailSource::new(&base, Duration::from_secs(2)).unwrap();
    let scope = scope();

    let sample = gmail.sample(TOKEN, &scope, 25).await.unwrap();
    assert_eq!(sample.service, ServiceName::Gmail);
    assert_eq!(sample.sample_count, 2);
    assert_eq!(sample.estimated_total, Some(27));
    // The failed subject lookup is skipped, not fatal
    assert_eq!(sample.sample_titles, vec!["Checkout kickoff"]);

    let seen = seen.lock().unwrap().clone();
    let search = &seen[0];
    assert_eq!(search.path, "/gmail/v1/users/me/messages");
    assert_eq!(search.query["q"], gmail_query(&scope));
    assert_eq!(search.query["maxResults"], "25");
    assert_eq!(search.authorization, format!("Bearer {}", TOKEN));
    assert_eq!(seen[1].query["format"], "metadata");
}

#[tokio::test]
async fn drive_sample_searches_with_scope_query() {
    let (base, seen) = google_stand_in().await;
    let drive = DriveSource::new(&base, Duration::from_secs(2)).unwrap();
    let scope = scope();

    let sample = drive.sample(TOKEN, &scope, 50).await.unwrap();
    assert_eq!(sample.sample_count, 1);
    assert_eq!(sample.estimated_total, None);
    assert_eq!(sample.sample_titles, vec!["Checkout plan"]);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0].path, "/drive/v3/files");
    assert_eq!(seen[0].query["q"], drive_query(&scope));
    assert_eq!(seen[0].query["pageSize"], "50");
    assert_eq!(seen[0].query["orderBy"], "modifiedTime desc");
}

#[tokio::test]
async fn rejected_token_is_unauthorized() {
    let (base, _) = google_stand_in().await;
    let drive = DriveSource::new(&base, Duration::from_secs(2)).unwrap();
    let err = drive.sample("ya29.revoked", &scope(), 10).await.unwrap_err();
    assert_eq!(err, SourceError::Unauthorized);
}

#[tokio::test]
async fn unreachable_source_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let gmail = GmailSource::new(&base, Duration::from_secs(2)).unwrap();
    let err = gmail.sample(TOKEN, &scope(), 10).await.unwrap_err();
    assert!(matches!(err, SourceError::Transport(_)));
}
