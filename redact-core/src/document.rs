//! # Modelo de Documento
//!
//! Representação mínima de um documento digitalizado, suficiente para os detectores,
//! os templates e a exportação:
//!
//! - uma lista de páginas, cada uma com suas dimensões em pontos;
//! - as palavras de cada página, com o retângulo em **espaço de página** e o intervalo
//!   de bytes correspondente no texto plano do documento;
//! - as marcas de redação já aplicadas (vazio num documento de entrada).
//!
//! A renderização e a leitura de PDFs/imagens ficam fora deste crate: quem produz o
//! `Document` (OCR, extrator de PDF) é um colaborador externo. Para textos puros,
//! [`Document::from_page_texts`] faz uma diagramação simples com métricas fixas.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::entity::{Location, TextSpan};
use crate::geometry::{PageRect, PageSize};

/// Margem usada pela diagramação de texto puro (1 polegada).
const LAYOUT_MARGIN: f64 = 72.0;
/// Tamanho de fonte da diagramação de texto puro.
const LAYOUT_FONT_SIZE: f64 = 10.0;
/// Largura média de um grafema, em frações do tamanho da fonte.
const LAYOUT_CHAR_WIDTH: f64 = 0.5;
/// Entrelinha, em frações do tamanho da fonte.
const LAYOUT_LINE_HEIGHT: f64 = 1.2;

/// Uma palavra posicionada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub rect: PageRect,
    pub span: TextSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub size: PageSize,
    #[serde(default)]
    pub words: Vec<Word>,
}

/// Caixa opaca aplicada pela exportação; `label` só existe no estilo placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactionMark {
    pub page: usize,
    pub rect: PageRect,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub pages: Vec<Page>,
    /// Texto plano; os `span` das palavras apontam para cá.
    pub text: String,
    #[serde(default)]
    pub redactions: Vec<RedactionMark>,
}

impl Document {
    pub fn new(pages: Vec<Page>, text: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            pages,
            text,
            redactions: Vec::new(),
        }
    }

    /// Diagrama textos puros, uma entrada por página.
    ///
    /// As palavras são separadas por espaços em branco; a largura de cada uma é estimada
    /// pela contagem de grafemas. Texto que não cabe na página continua numa nova página
    /// com as mesmas dimensões. No texto plano, as páginas são separadas por `\n`.
    pub fn from_page_texts(pages: &[(PageSize, &str)]) -> Self {
        let mut text = String::new();
        let mut out_pages: Vec<Page> = Vec::new();

        for (i, (size, page_text)) in pages.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            let base = text.len();
            text.push_str(page_text);

            let mut layout = PageLayout::new(*size);
            for (line_no, line) in line_offsets(page_text).into_iter().enumerate() {
                if line_no > 0 {
                    layout.new_line();
                }
                for (start, word) in split_words(&page_text[line.0..line.1]) {
                    let abs = base + line.0 + start;
                    let span = TextSpan::new(abs, abs + word.len());
                    if let Some(full) = layout.place(word, span) {
                        out_pages.push(full);
                    }
                }
            }
            out_pages.push(layout.finish());
        }

        Document::new(out_pages, text)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self, page: usize) -> Option<PageSize> {
        self.pages.get(page).map(|p| p.size)
    }

    pub fn full_text(&self) -> &str {
        &self.text
    }

    /// Texto das palavras cujo centro está dentro de `rect`, em ordem de leitura.
    ///
    /// Palavras contíguas no texto plano são unidas sem espaço; as demais com um espaço.
    /// Retorna `None` se a página não existir.
    pub fn text_in_rect(&self, page: usize, rect: &PageRect) -> Option<String> {
        let page = self.pages.get(page)?;
        let mut words: Vec<&Word> = page
            .words
            .iter()
            .filter(|w| rect.contains_point(w.rect.center()))
            .collect();
        words.sort_by_key(|w| w.span.start);

        let mut out = String::new();
        let mut prev_end: Option<usize> = None;
        for w in words {
            if let Some(end) = prev_end {
                if end != w.span.start {
                    out.push(' ');
                }
            }
            out.push_str(&w.text);
            prev_end = Some(w.span.end);
        }
        Some(out)
    }

    /// Localizações físicas cobrindo as palavras que tocam `span`.
    ///
    /// Palavras da mesma linha (mesma página, faixas verticais sobrepostas) são unidas
    /// num único retângulo.
    pub fn locate_span(&self, span: TextSpan) -> Vec<Location> {
        let mut out: Vec<Location> = Vec::new();
        for (page_idx, page) in self.pages.iter().enumerate() {
            for w in page.words.iter().filter(|w| w.span.overlaps(&span)) {
                match out.last_mut() {
                    Some(last) if last.page == page_idx && same_line(&last.rect, &w.rect) => {
                        last.rect = last.rect.union(&w.rect);
                    }
                    _ => out.push(Location::new(page_idx, w.rect)),
                }
            }
        }
        out
    }

    /// Todas as ocorrências de `term` como palavra inteira no texto plano.
    pub fn find_occurrences(&self, term: &str, case_sensitive: bool) -> Vec<TextSpan> {
        let term = term.trim();
        if term.is_empty() {
            return Vec::new();
        }
        let re = match RegexBuilder::new(&regex::escape(term))
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(re) => re,
            Err(_) => return Vec::new(),
        };
        re.find_iter(&self.text)
            .filter(|m| is_word_boundary(&self.text, m.start(), m.end()))
            .map(|m| TextSpan::new(m.start(), m.end()))
            .collect()
    }

    /// Recorte do texto plano, se o intervalo for válido.
    pub fn slice(&self, span: TextSpan) -> Option<&str> {
        self.text.get(span.start..span.end)
    }
}

fn same_line(a: &PageRect, b: &PageRect) -> bool {
    let overlap = a.top().min(b.top()) - a.y.max(b.y);
    overlap > 0.5 * a.height.min(b.height)
}

fn is_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(|c| c.is_alphanumeric()) && !after.is_some_and(|c| c.is_alphanumeric())
}

/// Intervalos `[início, fim)` de cada linha (sem o `\n`).
fn line_offsets(text: &str) -> Vec<(usize, usize)> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == '\n' {
            lines.push((start, i));
            start = i + 1;
        }
    }
    lines.push((start, text.len()));
    lines
}

/// Palavras separadas por espaço em branco, com o offset de início.
fn split_words(line: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                words.push((s, &line[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        words.push((s, &line[s..]));
    }
    words
}

/// Cursor de diagramação de uma página.
struct PageLayout {
    size: PageSize,
    words: Vec<Word>,
    x: f64,
    line: usize,
}

impl PageLayout {
    fn new(size: PageSize) -> Self {
        Self { size, words: Vec::new(), x: LAYOUT_MARGIN, line: 0 }
    }

    fn line_height() -> f64 {
        LAYOUT_FONT_SIZE * LAYOUT_LINE_HEIGHT
    }

    fn baseline(&self) -> f64 {
        self.size.height - LAYOUT_MARGIN - (self.line + 1) as f64 * Self::line_height()
    }

    fn new_line(&mut self) {
        self.line += 1;
        self.x = LAYOUT_MARGIN;
    }

    /// Posiciona a palavra; se a página encheu, devolve a página cheia.
    fn place(&mut self, word: &str, span: TextSpan) -> Option<Page> {
        let width = word.graphemes(true).count() as f64 * LAYOUT_FONT_SIZE * LAYOUT_CHAR_WIDTH;
        let space = LAYOUT_FONT_SIZE * LAYOUT_CHAR_WIDTH;

        if self.x > LAYOUT_MARGIN && self.x + width > self.size.width - LAYOUT_MARGIN {
            self.new_line();
        }

        let mut full = None;
        if self.baseline() < LAYOUT_MARGIN {
            let size = self.size;
            let done = std::mem::replace(self, PageLayout::new(size));
            full = Some(done.finish());
        }

        self.words.push(Word {
            text: word.to_string(),
            rect: PageRect::new(self.x, self.baseline(), width, LAYOUT_FONT_SIZE),
            span,
        });
        self.x += width + space;
        full
    }

    fn finish(self) -> Page {
        Page { size: self.size, words: self.words }
    }
}
