//! Mapping of pages and blocks onto the document's section tree
//!
//! Sections are materialized lazily: a section row is created the first time
//! a page inside its range is ingested, ancestors before descendants. Rows
//! committed by an earlier attempt are matched by their structural key
//! (order, level, title and page range), since engine ids are not stable
//! across parses.

use std::collections::HashMap;
use uuid::Uuid;

use crate::types::{ParsedDocument, ParsedSection, Section};

type SectionKey = (u32, u32, String, u32, u32);

fn key_of(order_index: u32, level: u32, title: &str, start: u32, end: u32) -> SectionKey {
    (order_index, level, title.to_string(), start, end)
}

/// Page-to-section lookup over one parsed document
pub struct SectionIndex<'a> {
    sections: &'a [ParsedSection],
    by_id: HashMap<&'a str, usize>,
    covering: HashMap<u32, Vec<usize>>,
    depth: Vec<usize>,
}

impl<'a> SectionIndex<'a> {
    pub fn build(doc: &'a ParsedDocument) -> Self {
        let sections = doc.sections.as_slice();
        let by_id: HashMap<&str, usize> = sections
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let last_page = doc.max_page();
        let mut covering: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, section) in sections.iter().enumerate() {
            for page in section.start_page..=section.end_page.min(last_page) {
                covering.entry(page).or_default().push(i);
            }
        }

        let mut index = Self {
            sections,
            by_id,
            covering,
            depth: Vec::new(),
        };
        index.depth = (0..sections.len()).map(|i| index.ancestors(i).len()).collect();
        index
    }

    pub fn section(&self, idx: usize) -> &'a ParsedSection {
        &self.sections[idx]
    }

    /// Sections whose range contains `page`, in document order
    pub fn covering(&self, page: u32) -> &[usize] {
        self.covering.get(&page).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Chain from the root down to `idx` (exclusive)
    pub fn ancestors(&self, idx: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut current = self.sections[idx].parent_id.as_deref();
        // Parent chains are acyclic after validation; the bound guards the rest
        while let Some(parent) = current {
            let Some(&p) = self.by_id.get(parent) else { break };
            if chain.len() >= self.sections.len() {
                break;
            }
            chain.push(p);
            current = self.sections[p].parent_id.as_deref();
        }
        chain.reverse();
        chain
    }

    /// Section a block on `page` belongs to.
    ///
    /// The deepest entry of the block's own section path that covers the page
    /// wins; otherwise the deepest section covering the page.
    pub fn resolve(&self, page: u32, section_path: &[String]) -> Option<usize> {
        let covering = self.covering(page);
        let from_path = section_path
            .iter()
            .rev()
            .filter_map(|id| self.by_id.get(id.as_str()).copied())
            .find(|idx| covering.contains(idx));
        if from_path.is_some() {
            return from_path;
        }
        covering
            .iter()
            .copied()
            .max_by_key(|&i| (self.depth[i], self.sections[i].order_index))
    }
}

/// Creates section rows on first reference, reusing rows of earlier attempts
pub struct SectionMaterializer {
    book_id: Uuid,
    existing: HashMap<SectionKey, Uuid>,
    created: HashMap<usize, Uuid>,
}

impl SectionMaterializer {
    /// `committed` are the section rows already stored for the book
    pub fn new(book_id: Uuid, committed: &[Section]) -> Self {
        let existing = committed
            .iter()
            .map(|s| (key_of(s.order_index, s.level, &s.title, s.start_page, s.end_page), s.id))
            .collect();
        Self {
            book_id,
            existing,
            created: HashMap::new(),
        }
    }

    /// Row id of section `idx`, appending new rows (ancestors first) to `out`
    pub fn ensure(&mut self, index: &SectionIndex<'_>, idx: usize, out: &mut Vec<Section>) -> Uuid {
        let mut chain = index.ancestors(idx);
        chain.push(idx);

        let mut parent: Option<Uuid> = None;
        for i in chain {
            let id = match self.created.get(&i) {
                Some(id) => *id,
                None => {
                    let s = index.section(i);
                    let key = key_of(s.order_index, s.level, &s.title, s.start_page, s.end_page);
                    let id = match self.existing.get(&key) {
                        Some(id) => *id,
                        None => {
                            let id = Uuid::new_v4();
                            out.push(Section {
                                id,
                                book_id: self.book_id,
                                parent_id: parent,
                                level: s.level,
                                title: s.title.clone(),
                                start_page: s.start_page,
                                end_page: s.end_page,
                                order_index: s.order_index,
                            });
                            id
                        }
                    };
                    self.created.insert(i, id);
                    id
                }
            };
            parent = Some(id);
        }
        // The loop always visits `idx` last
        parent.unwrap_or_else(Uuid::nil)
    }
}
