//! # Transformações de Coordenadas
//!
//! Três espaços de coordenadas convivem no sistema, e cada um tem o seu próprio tipo:
//!
//! | Espaço        | Tipo(s)                        | Origem            | Unidade                     |
//! |---------------|--------------------------------|-------------------|-----------------------------|
//! | Normalizado   | [`NormRect`]                   | topo-esquerda     | `[0, 1000]` em cada eixo    |
//! | Página        | [`PageRect`], [`PagePoint`]    | base-esquerda     | pontos de impressão         |
//! | Renderização  | [`RenderRect`], [`RenderPoint`]| topo-esquerda     | pixels, escalados por zoom  |
//!
//! ## Onde acontece a inversão do eixo Y
//!
//! A inversão do eixo Y ocorre **somente** nas funções que produzem um tipo de página a partir
//! de um tipo com origem topo-esquerda ([`normalized_to_page`], [`render_to_page`],
//! [`render_rect_to_page`]) e na inversa usada para desenhar ([`page_to_render`]).
//! Como os tipos são distintos, não há como aplicar a inversão duas vezes sem que o
//! compilador acuse a conversão.
//!
//! O espaço de página é o único persistido no modelo de entidades.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lado do espaço normalizado usado pelos detectores de visão.
pub const NORMALIZED_EXTENT: f64 = 1000.0;

/// Tolerância padrão para comparações de ponto flutuante.
pub const EPSILON: f64 = 1e-6;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("zoom inválido: {0} (deve ser finito e > 0)")]
    InvalidZoom(f64),

    #[error("dimensões de página inválidas: {width}x{height}")]
    InvalidPageSize { width: f64, height: f64 },

    #[error("caixa normalizada fora de [0, 1000]: {0:?}")]
    NormalizedOutOfRange(NormRect),

    #[error("caixa normalizada invertida (min > max): {0:?}")]
    NormalizedInverted(NormRect),
}

/// Dimensões de uma página em pontos.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    pub fn new(width: f64, height: f64) -> Result<Self, GeometryError> {
        if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
            return Err(GeometryError::InvalidPageSize { width, height });
        }
        Ok(Self { width, height })
    }

    /// A4 em pontos (595 x 842).
    pub fn a4() -> Self {
        Self { width: 595.0, height: 842.0 }
    }

    /// Verifica se duas páginas têm as mesmas dimensões, com tolerância relativa.
    ///
    /// `tolerance` é uma fração (ex: `0.02` = 2%) aplicada a cada eixo separadamente.
    pub fn congruent_with(&self, other: &PageSize, tolerance: f64) -> bool {
        let dw = (self.width - other.width).abs() / self.width.max(other.width);
        let dh = (self.height - other.height).abs() / self.height.max(other.height);
        dw <= tolerance && dh <= tolerance
    }
}

/// Caixa no espaço normalizado `[0,1000]²`, origem no canto superior esquerdo.
///
/// É apenas formato de transporte: nunca é armazenada numa entidade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormRect {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl NormRect {
    /// Constrói a partir do formato `[ymin, xmin, ymax, xmax]` usado pelos modelos de visão.
    pub fn from_box_2d(b: [f64; 4]) -> Self {
        Self { y_min: b[0], x_min: b[1], y_max: b[2], x_max: b[3] }
    }

    fn validate(&self) -> Result<(), GeometryError> {
        let in_range = |v: f64| v.is_finite() && (0.0..=NORMALIZED_EXTENT).contains(&v);
        if ![self.x_min, self.y_min, self.x_max, self.y_max].iter().all(|v| in_range(*v)) {
            return Err(GeometryError::NormalizedOutOfRange(*self));
        }
        if self.x_min > self.x_max || self.y_min > self.y_max {
            return Err(GeometryError::NormalizedInverted(*self));
        }
        Ok(())
    }
}

/// Ponto no espaço de página (origem base-esquerda).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PagePoint {
    pub x: f64,
    pub y: f64,
}

/// Retângulo no espaço de página: `(x, y)` é o canto **inferior** esquerdo.
///
/// Serializado como `[x, y, w, h]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct PageRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<[f64; 4]> for PageRect {
    fn from(a: [f64; 4]) -> Self {
        PageRect::new(a[0], a[1], a[2], a[3])
    }
}

impl From<PageRect> for [f64; 4] {
    fn from(r: PageRect) -> Self {
        [r.x, r.y, r.width, r.height]
    }
}

impl PageRect {
    /// Cria um retângulo; larguras/alturas negativas são normalizadas.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        let (x, width) = if width < 0.0 { (x + width, -width) } else { (x, width) };
        let (y, height) = if height < 0.0 { (y + height, -height) } else { (y, height) };
        Self { x, y, width, height }
    }

    pub fn from_corners(a: PagePoint, b: PagePoint) -> Self {
        Self::new(a.x.min(b.x), a.y.min(b.y), (a.x - b.x).abs(), (a.y - b.y).abs())
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn top(&self) -> f64 {
        self.y + self.height
    }

    pub fn center(&self) -> PagePoint {
        PagePoint { x: self.x + self.width / 2.0, y: self.y + self.height / 2.0 }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn contains_point(&self, p: PagePoint) -> bool {
        p.x >= self.x && p.x <= self.right() && p.y >= self.y && p.y <= self.top()
    }

    /// Interseção com área positiva (bordas encostadas não contam).
    pub fn intersects(&self, other: &PageRect) -> bool {
        self.x < other.right() && other.x < self.right() && self.y < other.top() && other.y < self.top()
    }

    pub fn union(&self, other: &PageRect) -> PageRect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        PageRect::new(x, y, self.right().max(other.right()) - x, self.top().max(other.top()) - y)
    }

    /// O retângulo cabe na página (com folga de `EPSILON`) e tem coordenadas finitas.
    pub fn is_within(&self, page: &PageSize) -> bool {
        [self.x, self.y, self.width, self.height].iter().all(|v| v.is_finite())
            && self.x >= -EPSILON
            && self.y >= -EPSILON
            && self.right() <= page.width + EPSILON
            && self.top() <= page.height + EPSILON
    }

    pub fn approx_eq(&self, other: &PageRect, tol: f64) -> bool {
        (self.x - other.x).abs() <= tol
            && (self.y - other.y).abs() <= tol
            && (self.width - other.width).abs() <= tol
            && (self.height - other.height).abs() <= tol
    }
}

/// Ponto no espaço de renderização (pixels, origem topo-esquerda).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderPoint {
    pub x: f64,
    pub y: f64,
}

/// Retângulo no espaço de renderização: `(x, y)` é o canto **superior** esquerdo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Fator de zoom da visualização, sempre finito e positivo.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Zoom(f64);

impl Zoom {
    pub fn new(value: f64) -> Result<Self, GeometryError> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(GeometryError::InvalidZoom(value))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Zoom {
    type Error = GeometryError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Zoom::new(value)
    }
}

impl From<Zoom> for f64 {
    fn from(z: Zoom) -> Self {
        z.0
    }
}

/// Converte uma caixa normalizada `[0,1000]` (topo-esquerda) para o espaço de página.
///
/// Escalas independentes em X (`width/1000`) e Y (`height/1000`). A inversão do eixo Y
/// acontece aqui e em nenhum outro ponto do caminho normalizado → página.
pub fn normalized_to_page(bbox: NormRect, page: PageSize) -> Result<PageRect, GeometryError> {
    bbox.validate()?;
    let sx = page.width / NORMALIZED_EXTENT;
    let sy = page.height / NORMALIZED_EXTENT;
    let x = bbox.x_min * sx;
    let width = (bbox.x_max - bbox.x_min) * sx;
    let height = (bbox.y_max - bbox.y_min) * sy;
    // y_max (topo-esquerda) é a borda inferior da caixa
    let y = page.height - bbox.y_max * sy;
    Ok(PageRect::new(x, y, width, height))
}

/// `x_page = x_render / zoom`; `y_page = page_height - y_render / zoom`.
pub fn render_to_page(pt: RenderPoint, zoom: Zoom, page_height: f64) -> PagePoint {
    PagePoint {
        x: pt.x / zoom.0,
        y: page_height - pt.y / zoom.0,
    }
}

/// Converte uma seleção feita na tela (ex: arrastar do mouse) para o espaço de página.
pub fn render_rect_to_page(rect: RenderRect, zoom: Zoom, page_height: f64) -> PageRect {
    let a = render_to_page(RenderPoint { x: rect.x, y: rect.y }, zoom, page_height);
    let b = render_to_page(
        RenderPoint { x: rect.x + rect.width, y: rect.y + rect.height },
        zoom,
        page_height,
    );
    PageRect::from_corners(a, b)
}

/// Inversa de [`render_rect_to_page`], usada apenas para desenhar.
pub fn page_to_render(rect: PageRect, zoom: Zoom, page_height: f64) -> RenderRect {
    let z = zoom.0;
    RenderRect {
        x: rect.x * z,
        // o topo da caixa na página vira a borda superior na tela
        y: (page_height - rect.top()) * z,
        width: rect.width * z,
        height: rect.height * z,
    }
}
