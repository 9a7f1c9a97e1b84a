//! Test doubles and fixtures shared by pipeline tests

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, Rgba, RgbaImage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::{EngineOptions, ParsingEngine};
use crate::error::{Error, Result};
use crate::indexing::FtsIndexer;
use crate::processing::{
    JobManager, PhaseRunner, PipelineContext, PipelineSettings, ProgressReporter, RunOutcome,
    RunningJobs, SubmitOutcome, SubmitRequest,
};
use crate::render::{AssetCropper, PageRenderer};
use crate::storage::{BookLayout, CatalogDb};
use crate::types::{
    AssetSource, AssetType, BBox, BlockType, ParsedAsset, ParsedBlock, ParsedDocument, ParsedPage,
    ParsedSection, SourceKind,
};

pub const PAGE_WIDTH: f64 = 612.0;
pub const PAGE_HEIGHT: f64 = 792.0;

/// How the fake engine answers `parse`
enum Script {
    Document(ParsedDocument),
    Fail(String),
    Hang,
}

/// Engine returning a scripted document
pub struct FakeEngine {
    pages: u32,
    script: Mutex<Script>,
    parse_calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new(doc: ParsedDocument, pages: u32) -> Self {
        Self::scripted(Script::Document(doc), pages)
    }

    /// Fails every parse with an engine error
    pub fn failing(pages: u32, message: &str) -> Self {
        Self::scripted(Script::Fail(message.to_string()), pages)
    }

    /// Never finishes a parse
    pub fn hanging(pages: u32) -> Self {
        Self::scripted(Script::Hang, pages)
    }

    fn scripted(script: Script, pages: u32) -> Self {
        Self {
            pages,
            script: Mutex::new(script),
            parse_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_document(&self, doc: ParsedDocument) {
        *self.script.lock() = Script::Document(doc);
    }

    pub fn parse_calls(&self) -> usize {
        self.parse_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParsingEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn version(&self) -> &str {
        "fake-1"
    }

    async fn count_pages(&self, _pdf_path: &Path) -> Result<u32> {
        Ok(self.pages)
    }

    async fn parse(&self, _pdf_path: &Path, _options: &EngineOptions) -> Result<ParsedDocument> {
        self.parse_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = match &*self.script.lock() {
            Script::Document(doc) => Some(Ok(doc.clone())),
            Script::Fail(message) => Some(Err(Error::engine(message.clone()))),
            Script::Hang => None,
        };
        match outcome {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

type RenderHook = Box<dyn Fn(u32) + Send + Sync>;

/// Renderer producing a solid image, a quarter of the page size in pixels
#[derive(Default)]
pub struct SolidRenderer {
    failing: HashSet<u32>,
    hook: Option<RenderHook>,
    calls: AtomicUsize,
}

impl SolidRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail renders of the given pages
    pub fn failing_on(mut self, pages: &[u32]) -> Self {
        self.failing = pages.iter().copied().collect();
        self
    }

    /// Run `hook` with the page number before each render
    pub fn with_hook(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageRenderer for SolidRenderer {
    fn name(&self) -> &str {
        "solid"
    }

    async fn render(&self, _pdf_path: &Path, page_number: u32) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.hook {
            hook(page_number);
        }
        if self.failing.contains(&page_number) {
            return Err(Error::storage(format!("render of page {} failed", page_number)));
        }
        let canvas = RgbaImage::from_pixel(
            (PAGE_WIDTH / 4.0) as u32,
            (PAGE_HEIGHT / 4.0) as u32,
            Rgba([250, 250, 250, 255]),
        );
        Ok(DynamicImage::ImageRgba8(canvas))
    }
}

/// Bytes passing the upload signature check, distinct per `tag`
pub fn pdf_bytes(tag: &str) -> Bytes {
    Bytes::from(format!("%PDF-1.4\n% fixture {}\n%%EOF\n", tag))
}

/// A book of `pages` pages with one chapter per ten pages.
///
/// Every page has a paragraph and a page-number furniture block; page 2
/// also carries a figure with a cropped asset and its caption.
pub fn book_document(pages: u32) -> ParsedDocument {
    let mut doc = ParsedDocument {
        engine: Some("fake".to_string()),
        engine_version: Some("fake-1".to_string()),
        source_kind: SourceKind::Digital,
        ..Default::default()
    };

    for chapter in 0..pages.div_ceil(10) {
        let start = chapter * 10 + 1;
        doc.sections.push(ParsedSection {
            id: format!("ch{}", chapter + 1),
            parent_id: None,
            level: 1,
            title: format!("Chapter {}", chapter + 1),
            start_page: start,
            end_page: (start + 9).min(pages),
            order_index: chapter,
        });
    }

    for number in 1..=pages {
        doc.pages.push(ParsedPage {
            number,
            width: PAGE_WIDTH,
            height: PAGE_HEIGHT,
        });
        let chapter = format!("ch{}", (number - 1) / 10 + 1);
        let mut order = 0;
        let mut push = |doc: &mut ParsedDocument, block_type: BlockType, text: String, bbox: BBox, asset: Option<String>| {
            doc.blocks.push(ParsedBlock {
                id: format!("p{}-b{}", number, order),
                page: number,
                block_type,
                text,
                markup: None,
                bbox,
                reading_order: order,
                section_path: vec![chapter.clone()],
                asset_id: asset,
                source_id: None,
                confidence: Some(0.98),
            });
            order += 1;
        };

        push(
            &mut doc,
            BlockType::Paragraph,
            format!("Text of page {} about lighthouses", number),
            BBox::new(72.0, 72.0, 468.0, 100.0),
            None,
        );
        if number == 2 {
            doc.assets.push(ParsedAsset {
                id: "fig-1".to_string(),
                page: 2,
                asset_type: AssetType::Figure,
                bbox: BBox::new(72.0, 200.0, 300.0, 200.0),
                source: AssetSource::Crop,
            });
            push(&mut doc, BlockType::Figure, String::new(), BBox::new(72.0, 200.0, 300.0, 200.0), Some("fig-1".to_string()));
            push(&mut doc, BlockType::Caption, "Figure 1: a lighthouse".to_string(), BBox::new(72.0, 410.0, 300.0, 20.0), None);
        }
        push(
            &mut doc,
            BlockType::Furniture,
            number.to_string(),
            BBox::new(300.0, 760.0, 12.0, 12.0),
            None,
        );
    }
    doc
}

/// Pipeline wired to the fakes, with a manager and a runner on the same catalog
pub struct Harness {
    pub dir: TempDir,
    pub ctx: PipelineContext,
    pub manager: JobManager,
    pub runner: PhaseRunner,
    /// Registry shared by the manager and the runner
    pub running: RunningJobs,
    pub engine: Arc<FakeEngine>,
    pub renderer: Arc<SolidRenderer>,
    receiver: mpsc::Receiver<Uuid>,
}

impl Harness {
    pub fn new(engine: FakeEngine, renderer: SolidRenderer, batch_size: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(CatalogDb::in_memory().unwrap());
        let layout = BookLayout::new(dir.path());
        let engine = Arc::new(engine);
        let renderer = Arc::new(renderer);

        let ctx = PipelineContext {
            indexer: Arc::new(FtsIndexer::new(db.clone(), "fts-test")),
            progress: ProgressReporter::new(db.clone(), 64),
            cropper: AssetCropper::new(layout.clone(), 0.5),
            engine: engine.clone(),
            renderer: renderer.clone(),
            settings: PipelineSettings {
                batch_size,
                lease_ttl: Duration::from_secs(60),
                render_all_pages: true,
                persist_engine_output: false,
                indexing_enabled: true,
            },
            db,
            layout,
        };

        let running = RunningJobs::new();
        let (manager, receiver) = JobManager::new(ctx.clone(), running.clone(), 64);
        let runner = PhaseRunner::new(ctx.clone(), running.clone());

        Self {
            dir,
            ctx,
            manager,
            runner,
            running,
            engine,
            renderer,
            receiver,
        }
    }

    pub fn db(&self) -> &CatalogDb {
        &self.ctx.db
    }

    pub fn request(&self, owner: &str, tag: &str) -> SubmitRequest {
        SubmitRequest {
            owner_id: owner.to_string(),
            file_name: format!("{}.pdf", tag),
            data: pdf_bytes(tag),
            title: None,
            author: None,
            language: None,
            ocr_enabled: false,
        }
    }

    pub async fn submit(&self, tag: &str) -> SubmitOutcome {
        self.manager.submit(self.request("owner-1", tag)).await.unwrap()
    }

    /// Run the next dispatched job to its next stop
    pub async fn run_next(&mut self) -> RunOutcome {
        let job_id = self.receiver.try_recv().expect("a dispatched job");
        self.runner.run(job_id).await.unwrap()
    }

    /// Take every dispatched job id not yet run
    pub fn drain_dispatches(&mut self) -> Vec<Uuid> {
        let mut drained = Vec::new();
        while let Ok(id) = self.receiver.try_recv() {
            drained.push(id);
        }
        drained
    }
}
