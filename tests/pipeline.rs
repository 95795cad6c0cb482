use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gallery_zip::GalleryError;
use gallery_zip::config::Settings;
use gallery_zip::downloader::{Downloader, HttpImageFetcher};
use gallery_zip::extractor::GalleryExtractor;
use gallery_zip::http::HttpClients;
use gallery_zip::models::{FailedUrl, JobEvent, JobPhase, JobStatus, JobSummary, UrlFailure};
use gallery_zip::orchestrator::Orchestrator;
use gallery_zip::packager::{Packager, ZipPackager};
use gallery_zip::registry::StrategyRegistry;
use gallery_zip::retry::RetryPolicy;
use gallery_zip::session::{JobState, SessionStore};
use gallery_zip::state::ArchiveStore;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER: &str = "alice";

struct Harness {
    orchestrator: Arc<Orchestrator>,
    _archives: TempDir,
    work: TempDir,
}

fn harness(strategies: &str, concurrency: usize, min_images: usize) -> Harness {
    harness_with(strategies, concurrency, min_images, Arc::new(ZipPackager))
}

fn harness_with(
    strategies: &str,
    concurrency: usize,
    min_images: usize,
    packager: Arc<dyn Packager>,
) -> Harness {
    let archives = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();

    let registry = StrategyRegistry::new();
    registry.load_json(strategies).unwrap();

    let clients = HttpClients::new(None).unwrap();
    let extractor = GalleryExtractor::new(clients.clone())
        .with_retry(RetryPolicy::page_fetch().with_base_delay(Duration::from_millis(10)));
    let downloader = Downloader::new(Arc::new(HttpImageFetcher::new(clients)), concurrency)
        .with_retry(RetryPolicy::image_fetch().with_base_delay(Duration::from_millis(10)));
    let store = ArchiveStore::new(archives.path(), "zip").unwrap();
    let settings = Settings {
        concurrency,
        min_images,
        archives_dir: archives.path().to_path_buf(),
        work_dir: work.path().to_path_buf(),
        public_url: "https://files.test/dl".to_string(),
        ..Default::default()
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(registry),
        extractor,
        downloader,
        packager,
        store,
        Arc::new(SessionStore::new()),
        settings,
    ));
    Harness {
        orchestrator,
        _archives: archives,
        work,
    }
}

fn gallery_page(images: &[&str]) -> String {
    let tags: String = images
        .iter()
        .map(|src| format!(r#"<img src="{}">"#, src))
        .collect();
    format!(
        r#"<html><body><div class="photos">{}</div><img class="logo" src="/static/logo.png"></body></html>"#,
        tags
    )
}

async fn serve_page(server: &MockServer, page: &str, images: &[&str]) {
    Mock::given(method("GET"))
        .and(path(page))
        .respond_with(ResponseTemplate::new(200).set_body_string(gallery_page(images)))
        .mount(server)
        .await;
}

async fn serve_images(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/img/.+"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0xAB; 2048])
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

fn zip_entries(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    names
}

fn local_rule(selector: &str) -> String {
    format!(
        r#"{{"127.0.0.1": {{"name": "Local", "selector": "{}"}}}}"#,
        selector
    )
}

async fn run(
    h: &Harness,
    urls: Vec<String>,
    name: &str,
) -> (JobSummary, Vec<JobEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = h
        .orchestrator
        .submit(USER, urls, Some(name.to_string()), tx)
        .unwrap();
    let summary = handle.await.unwrap();
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (summary, events)
}

fn work_dir_is_empty(h: &Harness) -> bool {
    std::fs::read_dir(h.work.path()).unwrap().next().is_none()
}

#[tokio::test]
async fn two_mapped_galleries_end_up_in_one_archive() {
    let server = MockServer::start().await;
    serve_page(&server, "/g/alpha", &["/img/a1.jpg", "/img/a2.jpg", "/img/a3.jpg"]).await;
    serve_page(&server, "/g/beta", &["/img/b1.png", "/img/b2.png"]).await;
    serve_images(&server, Duration::ZERO).await;

    let h = harness(&local_rule("div.photos img"), 5, 1);
    let urls = vec![
        format!("{}/g/alpha", server.uri()),
        format!("{}/g/beta", server.uri()),
    ];
    let (summary, events) = run(&h, urls.clone(), "holiday").await;

    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(summary.success_count, 5);
    assert_eq!(summary.total_count, 5);
    assert!(summary.failed_urls.is_empty());
    assert_eq!(summary.galleries.len(), 2);
    assert_eq!(summary.galleries[0].strategy, "127.0.0.1");

    let file_name = summary.archive_file.clone().unwrap();
    assert!(file_name.starts_with("holiday_") && file_name.ends_with(".zip"));
    assert_eq!(
        summary.download_url.as_deref(),
        Some(format!("https://files.test/dl/{}", file_name).as_str())
    );

    let store = h.orchestrator.store();
    let entries = zip_entries(&store.root().join(&file_name));
    assert_eq!(entries.len(), 5);
    assert_eq!(entries.iter().filter(|e| e.starts_with("alpha/")).count(), 3);
    assert_eq!(entries.iter().filter(|e| e.starts_with("beta/")).count(), 2);
    assert!(!entries.iter().any(|e| e.contains("logo")));

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    let record = listed[0].record.clone().unwrap();
    assert_eq!(record.archive_name, "holiday");
    assert_eq!(record.urls, urls);
    assert_eq!(record.image_count, 5);

    assert!(matches!(events.last(), Some(JobEvent::Finished(_))));
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::Progress(p) if p.phase == JobPhase::Packaging
    )));
    assert_eq!(h.orchestrator.sessions().state(USER), JobState::Idle);
    assert!(work_dir_is_empty(&h));
}

#[tokio::test]
async fn unmapped_site_is_matched_by_discovery() {
    let server = MockServer::start().await;
    let images: Vec<String> = (1..=7).map(|i| format!("/img/p{}.jpg", i)).collect();
    let images: Vec<&str> = images.iter().map(String::as_str).collect();
    serve_page(&server, "/album/seven", &images).await;
    serve_images(&server, Duration::ZERO).await;

    let strategies = r#"{
        "a.example": {"selector": "img.never-there"},
        "b.example": {"name": "B", "selector": "div.photos img"}
    }"#;
    let h = harness(strategies, 3, 5);
    let (summary, _) = run(&h, vec![format!("{}/album/seven", server.uri())], "found").await;

    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(summary.success_count, 7);
    assert_eq!(summary.galleries.len(), 1);
    assert_eq!(summary.galleries[0].strategy, "b.example");
    assert_eq!(summary.galleries[0].name, "seven");
}

#[tokio::test]
async fn nothing_extracted_fails_without_an_artifact() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><p>no pictures</p></html>"))
        .mount(&server)
        .await;

    let h = harness(&local_rule("div.photos img"), 5, 5);
    let url = format!("{}/empty", server.uri());
    let (summary, events) = run(&h, vec![url.clone(), "http//broken".into()], "nothing").await;

    assert_eq!(summary.status, JobStatus::Failed);
    assert_eq!(
        summary.error.as_deref(),
        Some(GalleryError::NoImagesFound.to_string().as_str())
    );
    assert_eq!(
        summary.failed_urls,
        vec![
            FailedUrl::new(url, UrlFailure::NoImages),
            FailedUrl::new("http//broken", UrlFailure::Malformed),
        ]
    );
    assert!(summary.archive_file.is_none());
    assert!(h.orchestrator.store().list().unwrap().is_empty());
    assert!(matches!(events.last(), Some(JobEvent::Finished(_))));
    assert_eq!(h.orchestrator.sessions().state(USER), JobState::Idle);
    assert!(work_dir_is_empty(&h));
}

#[tokio::test]
async fn second_submission_is_rejected_while_processing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/g/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(gallery_page(&["/img/s1.jpg"]))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;
    serve_images(&server, Duration::ZERO).await;

    let h = harness(&local_rule("div.photos img"), 5, 1);
    let url = format!("{}/g/slow", server.uri());

    let (tx, _rx) = mpsc::unbounded_channel();
    let first = h
        .orchestrator
        .submit(USER, vec![url.clone()], Some("first".into()), tx)
        .unwrap();

    let (tx, _rx2) = mpsc::unbounded_channel();
    let second = h
        .orchestrator
        .submit(USER, vec![url.clone()], Some("second".into()), tx);
    assert!(matches!(second, Err(GalleryError::AlreadyProcessing)));
    assert_eq!(h.orchestrator.sessions().state(USER), JobState::Processing);

    let (tx, _rx3) = mpsc::unbounded_channel();
    let other_user = h
        .orchestrator
        .submit("bob", vec![url], Some("bobs".into()), tx)
        .unwrap();

    let summary = first.await.unwrap();
    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(other_user.await.unwrap().status, JobStatus::Done);
    assert_eq!(h.orchestrator.sessions().state(USER), JobState::Idle);
}

#[tokio::test]
async fn cancelled_job_packages_what_was_downloaded() {
    let server = MockServer::start().await;
    let images: Vec<String> = (1..=6).map(|i| format!("/img/c{}.jpg", i)).collect();
    let images: Vec<&str> = images.iter().map(String::as_str).collect();
    serve_page(&server, "/g/long", &images).await;
    serve_images(&server, Duration::from_millis(300)).await;

    let h = harness(&local_rule("div.photos img"), 2, 1);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = h
        .orchestrator
        .submit(
            USER,
            vec![format!("{}/g/long", server.uri())],
            Some("partial".into()),
            tx,
        )
        .unwrap();

    while let Some(event) = rx.recv().await {
        if let JobEvent::Progress(p) = &event {
            if p.phase == JobPhase::Downloading && p.images_done >= 2 {
                assert!(h.orchestrator.cancel(USER));
                break;
            }
        }
    }

    let summary = handle.await.unwrap();
    assert_eq!(summary.status, JobStatus::Partial);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.total_count, 6);

    let file_name = summary.archive_file.unwrap();
    let entries = zip_entries(&h.orchestrator.store().root().join(file_name));
    assert_eq!(entries.len(), 2);
    assert_eq!(h.orchestrator.sessions().state(USER), JobState::Idle);
    assert!(work_dir_is_empty(&h));
}

#[tokio::test]
async fn invalid_archive_name_is_rejected_before_starting() {
    let h = harness(&local_rule("img"), 5, 1);
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = h.orchestrator.submit(
        USER,
        vec!["https://127.0.0.1/g/x".into()],
        Some("../escape".into()),
        tx,
    );
    assert!(matches!(result, Err(GalleryError::InvalidArchiveName(_))));
    assert_eq!(h.orchestrator.sessions().state(USER), JobState::Idle);
}

#[tokio::test]
async fn every_image_failing_leaves_no_artifact() {
    let server = MockServer::start().await;
    serve_page(&server, "/g/dead", &["/img/d1.jpg", "/img/d2.jpg", "/img/d3.jpg"]).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/img/.+"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness(&local_rule("div.photos img"), 2, 1);
    let (summary, events) = run(&h, vec![format!("{}/g/dead", server.uri())], "dead").await;

    assert_eq!(summary.status, JobStatus::Failed);
    assert_eq!(
        summary.error.as_deref(),
        Some(GalleryError::NoImagesDownloaded.to_string().as_str())
    );
    assert_eq!(summary.success_count, 0);
    assert_eq!(summary.total_count, 3);
    assert!(summary.archive_file.is_none());
    assert!(h.orchestrator.store().list().unwrap().is_empty());
    assert_eq!(
        std::fs::read_dir(h.orchestrator.store().root()).unwrap().count(),
        0
    );
    assert!(matches!(events.last(), Some(JobEvent::Finished(_))));
    assert_eq!(h.orchestrator.sessions().state(USER), JobState::Idle);
    assert!(work_dir_is_empty(&h));
}

fn mixed_page() -> String {
    let many: String = (1..=6)
        .map(|i| format!(r#"<img src="/img/m{}.jpg">"#, i))
        .collect();
    format!(
        r#"<html><body><div class="few"><img src="/img/f1.jpg"><img src="/img/f2.jpg"></div><section class="many">{}</section></body></html>"#,
        many
    )
}

async fn serve_mixed(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/g/mixed"))
        .respond_with(ResponseTemplate::new(200).set_body_string(mixed_page()))
        .mount(server)
        .await;
    serve_images(server, Duration::ZERO).await;
}

#[tokio::test]
async fn low_yield_mapped_rule_gives_way_to_discovery() {
    let server = MockServer::start().await;
    serve_mixed(&server).await;

    let strategies = r#"{
        "127.0.0.1": {"selector": "div.few img"},
        "c.example": {"selector": "section.many img"}
    }"#;
    let h = harness(strategies, 3, 5);
    let (summary, _) = run(&h, vec![format!("{}/g/mixed", server.uri())], "mixed").await;

    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(summary.success_count, 6);
    assert_eq!(summary.galleries.len(), 1);
    assert_eq!(summary.galleries[0].strategy, "c.example");

    let entries = zip_entries(&h.orchestrator.store().root().join(summary.archive_file.unwrap()));
    assert_eq!(entries.len(), 6);
    assert!(entries.iter().all(|e| e.contains("_m")));
}

#[tokio::test]
async fn low_yield_is_kept_when_discovery_finds_nothing_better() {
    let server = MockServer::start().await;
    serve_mixed(&server).await;

    let strategies = r#"{
        "127.0.0.1": {"selector": "div.few img"},
        "d.example": {"selector": "img.never-there"}
    }"#;
    let h = harness(strategies, 3, 5);
    let (summary, _) = run(&h, vec![format!("{}/g/mixed", server.uri())], "fewer").await;

    assert_eq!(summary.status, JobStatus::Done);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.total_count, 2);
    assert_eq!(summary.galleries[0].strategy, "127.0.0.1");
    assert!(summary.failed_urls.is_empty());
}

/// Writes the archive, then occupies the sidecar path with a directory so
/// the record cannot be saved.
struct BlockedRecord;

#[async_trait::async_trait]
impl Packager for BlockedRecord {
    async fn package(&self, src_dir: &Path, dest: &Path) -> gallery_zip::Result<u64> {
        let size = ZipPackager.package(src_dir, dest).await?;
        std::fs::create_dir(dest.with_extension("json"))?;
        Ok(size)
    }

    fn extension(&self) -> &'static str {
        "zip"
    }
}

#[tokio::test]
async fn unsaved_record_removes_the_archive() {
    let server = MockServer::start().await;
    serve_page(&server, "/g/alpha", &["/img/a1.jpg", "/img/a2.jpg"]).await;
    serve_images(&server, Duration::ZERO).await;

    let h = harness_with(&local_rule("div.photos img"), 2, 1, Arc::new(BlockedRecord));
    let (summary, _) = run(&h, vec![format!("{}/g/alpha", server.uri())], "orphan").await;

    assert_eq!(summary.status, JobStatus::Failed);
    assert!(summary.archive_file.is_none());
    let leftovers: Vec<_> = std::fs::read_dir(h.orchestrator.store().root())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .collect();
    assert!(leftovers.is_empty(), "archive left behind: {:?}", leftovers);
    assert!(h.orchestrator.store().list().unwrap().is_empty());
    assert_eq!(h.orchestrator.sessions().state(USER), JobState::Idle);
}
