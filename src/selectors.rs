//! Selector registry.
//!
//! Each logical field (`car_links`, `price`, `title`, per-spec keys, ...)
//! maps to an ordered chain of CSS selectors. Position in the chain is
//! priority: single-value fields take the first selector that matches.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub const CAR_LINKS: &str = "car_links";
pub const PRICE: &str = "price";
pub const TITLE: &str = "title";
pub const YEAR: &str = "year";
pub const MILEAGE: &str = "mileage";
pub const FUEL: &str = "fuel";
pub const TRANSMISSION: &str = "transmission";
pub const COLOR: &str = "color";
pub const PLATE: &str = "plate";
pub const DOORS: &str = "doors";
pub const IMAGES: &str = "images";
pub const OPTIONALS_SECTION: &str = "optionals_section";
pub const CONTACT_BUTTON: &str = "contact_button";
pub const SELLER: &str = "seller";
pub const DESCRIPTION: &str = "description";
pub const VIEWS: &str = "views";

/// Spec fields that can be read straight off a labelled element before
/// falling back to text inference.
pub const SPEC_FIELDS: &[&str] = &[MILEAGE, FUEL, TRANSMISSION, YEAR, DOORS, COLOR, PLATE];

/// Ordered selector chains keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectorSet {
    chains: BTreeMap<String, Vec<String>>,
}

impl SelectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append selectors to the end of a field's chain.
    pub fn extend<I, S>(&mut self, field: &str, selectors: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chains
            .entry(field.to_string())
            .or_default()
            .extend(selectors.into_iter().map(Into::into));
    }

    /// The chain for `field`, empty when the field is unknown.
    pub fn chain(&self, field: &str) -> &[String] {
        self.chains.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Merge rule sets: site-specific chains first, then generic, then
    /// caller overrides appended last. Nothing is dropped or deduplicated,
    /// so the built-in coverage always stays in place behind custom rules.
    pub fn merge(builtin: &SelectorSet, generic: &SelectorSet, custom: &SelectorSet) -> SelectorSet {
        let mut merged = builtin.clone();
        for source in [generic, custom] {
            for (field, selectors) in &source.chains {
                merged.extend(field, selectors.iter().cloned());
            }
        }
        merged
    }

    /// Built-in rules merged with optional caller overrides.
    pub fn resolve(custom: Option<&HashMap<String, Vec<String>>>) -> SelectorSet {
        let custom = custom.map(SelectorSet::from).unwrap_or_default();
        SelectorSet::merge(&autocarro_rules(), &generic_rules(), &custom)
    }
}

impl From<&HashMap<String, Vec<String>>> for SelectorSet {
    fn from(map: &HashMap<String, Vec<String>>) -> Self {
        let mut set = SelectorSet::new();
        for (field, selectors) in map {
            set.extend(field, selectors.iter().cloned());
        }
        set
    }
}

/// Site-specific rules for autocarro.com.br.
pub fn autocarro_rules() -> SelectorSet {
    let mut set = SelectorSet::new();
    set.extend(
        CAR_LINKS,
        [
            r#"a[href*="/anuncio/"]"#,
            r#"a[href*="/veiculo/"]"#,
            ".item-carro a",
            ".card-veiculo a",
            ".anuncio-item a",
        ],
    );
    set.extend(
        PRICE,
        [
            ".preco-valor",
            ".valor-venda",
            ".price-container .valor",
            r#"[class*="prec"]"#,
            ".price-display",
        ],
    );
    set.extend(
        TITLE,
        [
            "h1.titulo-veiculo",
            "h1.car-title",
            ".vehicle-title h1",
            ".anuncio-titulo h1",
        ],
    );
    set.extend(YEAR, [".ano-modelo", ".badge-ano", ".year-badge"]);
    set.extend(
        MILEAGE,
        [".icon-km + span", ".kilometragem-valor", r#"[data-icon="km"] + span"#],
    );
    set.extend(
        FUEL,
        [".icon-fuel + span", ".combustivel-tipo", r#"[data-icon="fuel"] + span"#],
    );
    set.extend(
        TRANSMISSION,
        [".icon-gear + span", ".cambio-tipo", r#"[data-icon="transmission"] + span"#],
    );
    set.extend(
        COLOR,
        [".icon-color + span", ".cor-veiculo", r#"[data-icon="color"] + span"#],
    );
    set.extend(
        PLATE,
        [".icon-plate + span", ".placa-veiculo", r#"[data-icon="plate"] + span"#],
    );
    set.extend(
        DOORS,
        [".icon-doors + span", ".numero-portas", r#"[data-icon="doors"] + span"#],
    );
    // gallery first, thumbnails after
    set.extend(
        IMAGES,
        [
            ".gallery-container img",
            ".carousel-images img",
            ".vehicle-photos img",
            ".galeria-fotos img",
            ".thumbs-container img",
            ".thumbnail-gallery img",
            ".mini-fotos img",
            r#"img[src*="autocarro"]"#,
        ],
    );
    set.extend(
        OPTIONALS_SECTION,
        [".opcionais-lista", ".optional-items", ".vehicle-features", ".features-list"],
    );
    set.extend(
        CONTACT_BUTTON,
        [
            ".btn-contato",
            ".enviar-proposta",
            ".contact-dealer",
            r#"button[onclick*="proposta"]"#,
        ],
    );
    set.extend(SELLER, [".dealer-name", ".vendedor-nome", ".loja-nome"]);
    set
}

/// Fallback rules that tend to work on unknown car-sales markup.
pub fn generic_rules() -> SelectorSet {
    let mut set = SelectorSet::new();
    set.extend(
        CAR_LINKS,
        [
            r#"a[href*="/veiculo/"]"#,
            r#"a[href*="/carro/"]"#,
            r#"a[href*="/automovel/"]"#,
            r#"a[href*="/anuncio/"]"#,
            r#"a[href*="/vehicle/"]"#,
            ".item-carro a",
            ".veiculo-item a",
            ".car-item a",
            ".anuncio-item a",
            ".vehicle-card a",
            ".card-veiculo a",
        ],
    );
    set.extend(
        PRICE,
        [
            ".preco",
            ".price",
            ".valor",
            ".preço",
            r#"[class*="prec"]"#,
            r#"[class*="valor"]"#,
            r#"[class*="price"]"#,
            ".price-value",
            ".car-price",
            ".veiculo-preco",
            ".price-container",
            ".valor-venda",
            ".preco-venda",
        ],
    );
    set.extend(
        TITLE,
        [
            "h1",
            ".titulo",
            ".title",
            ".nome-veiculo",
            ".car-title",
            ".vehicle-title",
            ".anuncio-titulo",
        ],
    );
    set.extend(
        IMAGES,
        [
            ".galeria img",
            ".fotos img",
            ".gallery img",
            ".car-images img",
            ".vehicle-photos img",
            ".carousel img",
            ".slider img",
            ".thumbs img",
            r#"img[alt*="carro"]"#,
            r#"img[alt*="veículo"]"#,
        ],
    );
    set.extend(
        OPTIONALS_SECTION,
        [".opcionais", ".optional", ".features", ".equipamentos", ".acessorios", ".extras"],
    );
    set.extend(
        DESCRIPTION,
        [".descricao", ".description", r#"[itemprop="description"]"#],
    );
    set.extend(VIEWS, [".visitas", ".views"]);
    set
}
