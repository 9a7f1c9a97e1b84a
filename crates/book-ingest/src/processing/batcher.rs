//! Ingestion batcher
//!
//! Turns a validated [`ParsedDocument`] into catalog rows and image files in
//! page-ordered batches. Each batch is committed in one transaction together
//! with the job's `current_page`, so a crash or pause never leaves a partially
//! ingested batch behind. Files written for a batch that fails to commit are
//! removed again.

use image::DynamicImage;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use uuid::Uuid;

use super::control::{Checkpoint, Directive};
use super::sections::{SectionIndex, SectionMaterializer};
use super::PipelineContext;
use crate::error::{Error, Result};
use crate::storage::BatchRows;
use crate::types::{
    Asset, AssetSource, BBox, Block, Book, Page, PageStatus, ParseJob, ParsedAsset, ParsedBlock,
    ParsedDocument, ParsedPage,
};

/// How an ingestion run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Every page up to the total is committed
    Completed,
    /// Stopped on a pause request after committing `last_page`
    Paused { last_page: u32 },
}

/// Engine output indexed by page
struct DocumentView<'a> {
    pages: HashMap<u32, &'a ParsedPage>,
    blocks: HashMap<u32, Vec<&'a ParsedBlock>>,
    assets: HashMap<&'a str, &'a ParsedAsset>,
    /// Dimensions recorded for pages the engine skipped
    fallback_size: (f64, f64),
}

impl<'a> DocumentView<'a> {
    fn new(doc: &'a ParsedDocument) -> Self {
        let pages: HashMap<u32, &ParsedPage> = doc.pages.iter().map(|p| (p.number, p)).collect();

        let mut blocks: HashMap<u32, Vec<&ParsedBlock>> = HashMap::new();
        for block in &doc.blocks {
            blocks.entry(block.page).or_default().push(block);
        }
        for page_blocks in blocks.values_mut() {
            page_blocks.sort_by_key(|b| b.reading_order);
        }

        let referenced: HashSet<&str> = doc.blocks.iter().filter_map(|b| b.asset_id.as_deref()).collect();
        let orphaned = doc.assets.iter().filter(|a| !referenced.contains(a.id.as_str())).count();
        if orphaned > 0 {
            tracing::debug!("Ignoring {} assets not referenced by any block", orphaned);
        }

        let fallback_size = doc
            .pages
            .first()
            .map(|p| (p.width, p.height))
            .unwrap_or((0.0, 0.0));

        Self {
            pages,
            blocks,
            assets: doc.assets.iter().map(|a| (a.id.as_str(), a)).collect(),
            fallback_size,
        }
    }

    fn blocks_on(&self, page: u32) -> &[&'a ParsedBlock] {
        self.blocks.get(&page).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Image files one page produces, written off the async runtime
#[derive(Default)]
struct PageImages {
    render: Option<DynamicImage>,
    page_rel: String,
    thumb_rel: String,
    width: f64,
    height: f64,
    crops: Vec<(BBox, String)>,
    inline: Vec<(Vec<u8>, String)>,
}

impl PageImages {
    fn is_empty(&self) -> bool {
        self.render.is_none() && self.inline.is_empty()
    }

    fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if self.render.is_some() {
            paths.push(self.page_rel.clone());
            paths.push(self.thumb_rel.clone());
            paths.extend(self.crops.iter().map(|(_, rel)| rel.clone()));
        }
        paths.extend(self.inline.iter().map(|(_, rel)| rel.clone()));
        paths
    }
}

/// Batched ingestion for one job attempt
pub struct IngestionBatcher<'a> {
    ctx: &'a PipelineContext,
    job: &'a ParseJob,
    book: &'a Book,
    checkpoint: &'a Checkpoint,
    pdf_path: PathBuf,
}

impl<'a> IngestionBatcher<'a> {
    pub fn new(ctx: &'a PipelineContext, job: &'a ParseJob, book: &'a Book, checkpoint: &'a Checkpoint) -> Self {
        Self {
            pdf_path: ctx.layout.resolve(&book.storage_path),
            ctx,
            job,
            book,
            checkpoint,
        }
    }

    /// Ingest pages `resume_after + 1 ..= total_pages`.
    ///
    /// Content for pages up to `resume_after` must already be committed and
    /// nothing after it may exist.
    pub async fn ingest(&self, doc: &ParsedDocument, resume_after: u32, total_pages: u32) -> Result<IngestOutcome> {
        let view = DocumentView::new(doc);
        let index = SectionIndex::build(doc);
        let committed = self.ctx.db.list_sections(self.book.id)?;
        let mut sections = SectionMaterializer::new(self.book.id, &committed);
        let batch_size = self.job.config.batch_size.max(1);

        let mut first = resume_after + 1;
        while first <= total_pages {
            let last = first.saturating_add(batch_size - 1).min(total_pages);
            let mut rows = BatchRows::default();
            let mut written = Vec::new();

            let prepared = self
                .prepare_batch(first, last, &view, &index, &mut sections, &mut rows, &mut written)
                .await;
            let committed = prepared.and_then(|()| {
                self.ctx.progress.batch_committed(
                    self.job,
                    self.checkpoint.owner(),
                    &rows,
                    first,
                    last,
                    total_pages,
                )
            });
            if let Err(e) = committed {
                self.ctx.layout.remove_files(&written);
                return Err(e.into_storage());
            }

            if self.checkpoint.check()? == Directive::Pause {
                return Ok(IngestOutcome::Paused { last_page: last });
            }
            first = last + 1;
        }

        Ok(IngestOutcome::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_batch(
        &self,
        first: u32,
        last: u32,
        view: &DocumentView<'_>,
        index: &SectionIndex<'_>,
        sections: &mut SectionMaterializer,
        rows: &mut BatchRows,
        written: &mut Vec<String>,
    ) -> Result<()> {
        for page_number in first..=last {
            for &idx in index.covering(page_number) {
                sections.ensure(index, idx, &mut rows.sections);
            }

            let page_id = Uuid::new_v4();
            let Some(parsed) = view.pages.get(&page_number) else {
                let (width, height) = view.fallback_size;
                rows.pages.push(Page {
                    id: page_id,
                    book_id: self.book.id,
                    page_number,
                    width,
                    height,
                    image_path: None,
                    thumbnail_path: None,
                    status: PageStatus::Skipped,
                });
                continue;
            };

            let mut images = PageImages {
                page_rel: self.ctx.layout.page_image_rel(self.book.id, page_number),
                thumb_rel: self.ctx.layout.thumbnail_rel(self.book.id, page_number),
                width: parsed.width,
                height: parsed.height,
                ..Default::default()
            };

            for block in view.blocks_on(page_number) {
                let block_id = Uuid::new_v4();
                let asset = block.asset_id.as_deref().and_then(|id| view.assets.get(id));
                let asset_id = asset.map(|_| Uuid::new_v4());

                if let (Some(asset), Some(asset_id)) = (asset, asset_id) {
                    let rel = self.ctx.layout.asset_rel(self.book.id, page_number, asset_id);
                    match &asset.source {
                        AssetSource::Crop => images.crops.push((asset.bbox, rel.clone())),
                        AssetSource::Inline { data } => images.inline.push((data.clone(), rel.clone())),
                    }
                    rows.assets.push(Asset {
                        id: asset_id,
                        book_id: self.book.id,
                        page_id,
                        page_number,
                        block_id,
                        asset_type: asset.asset_type,
                        file_path: rel,
                        bbox: asset.bbox,
                    });
                }

                rows.blocks.push(Block {
                    id: block_id,
                    book_id: self.book.id,
                    page_id,
                    page_number,
                    section_id: index
                        .resolve(page_number, &block.section_path)
                        .map(|idx| sections.ensure(index, idx, &mut rows.sections)),
                    block_type: block.block_type,
                    text: block.text.clone(),
                    markup: block.markup.clone(),
                    bbox: block.bbox,
                    reading_order: block.reading_order,
                    asset_id,
                    source_id: block.source_id.clone().or_else(|| Some(block.id.clone())),
                    confidence: block.confidence,
                });
            }

            let status = self.render_page(page_number, &mut images).await?;
            let (image_path, thumbnail_path) = if images.render.is_some() {
                (Some(images.page_rel.clone()), Some(images.thumb_rel.clone()))
            } else {
                (None, None)
            };

            rows.pages.push(Page {
                id: page_id,
                book_id: self.book.id,
                page_number,
                width: parsed.width,
                height: parsed.height,
                image_path,
                thumbnail_path,
                status,
            });

            if !images.is_empty() {
                written.extend(images.paths());
                self.write_images(images).await?;
            }
        }
        Ok(())
    }

    /// Render the page when it has crops or every page is rendered.
    ///
    /// A page without crops whose render fails is recorded as failed; a page
    /// that needs crops cannot be ingested without its render.
    async fn render_page(&self, page_number: u32, images: &mut PageImages) -> Result<PageStatus> {
        let needs_crop = !images.crops.is_empty();
        if !needs_crop && !self.ctx.settings.render_all_pages {
            return Ok(PageStatus::Parsed);
        }

        match self.ctx.renderer.render(&self.pdf_path, page_number).await {
            Ok(image) => {
                images.render = Some(image);
                Ok(PageStatus::Parsed)
            }
            Err(e) if needs_crop => Err(e.into_storage()),
            Err(e) => {
                tracing::warn!(
                    "Rendering page {} of book {} failed: {}",
                    page_number,
                    self.book.id,
                    e
                );
                Ok(PageStatus::Failed)
            }
        }
    }

    async fn write_images(&self, images: PageImages) -> Result<()> {
        let cropper = self.ctx.cropper.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(render) = &images.render {
                cropper.save_page(render, &images.page_rel, &images.thumb_rel)?;
                for (bbox, rel) in &images.crops {
                    cropper.crop(render, images.width, images.height, bbox, rel)?;
                }
            }
            for (data, rel) in &images.inline {
                cropper.save_inline(data, rel)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::internal(format!("image task failed: {}", e)))?
    }
}
