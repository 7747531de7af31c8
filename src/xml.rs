use anyhow::Context;
use lazy_regex::regex;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Candidate element names per logical field, probed in order with the
/// first non-empty text winning. English variants first, Hebrew after,
/// matching what the retailers actually publish. Data-driven on purpose:
/// new variants are a list entry, not new control flow.
const STORE_ID_TAGS: &[&str] = &["StoreId", "StoreID", "storeid"];
const STORE_NAME_TAGS: &[&str] = &["StoreName", "StoreNm", "Name", "שם_סניף", "סניף", "שם"];
const CITY_TAGS: &[&str] = &["City", "CityName", "StoreCity", "עיר", "יישוב"];
const ADDRESS_TAGS: &[&str] = &[
    "Address",
    "Street",
    "StoreAddress",
    "AddressLine1",
    "FullAddress",
    "Location",
    "StreetAddress",
    "Addr",
    "StoreLocation",
    "כתובת",
    "רחוב",
    "מיקום",
    "כתובת_סניף",
];
const BARCODE_TAGS: &[&str] = &["ItemCode", "Barcode"];
const ITEM_NAME_TAGS: &[&str] = &["ItemName", "ItemNm", "ItemDescription", "Description"];
const REGULAR_PRICE_TAGS: &[&str] = &["ItemPrice", "Price", "RegularPrice", "ListPrice"];
const PROMO_PRICE_TAGS: &[&str] =
    &["PromotionPrice", "DiscountedPrice", "SalePrice", "DiscountPrice"];
const PRICE_DATE_TAGS: &[&str] = &["PriceUpdateDate", "UpdateDate"];
const PROMO_DISCOUNT_TAGS: &[&str] = &["DiscountedPrice", "DiscountRate"];
const PROMO_DATE_TAGS: &[&str] = &["PromotionUpdateDate", "UpdateDate", "PromotionStartDate"];
const QUANTITY_TAGS: &[&str] = &["Quantity", "Content", "QtyInPackage"];
const UNIT_TAGS: &[&str] = &["UnitQty", "UnitOfMeasure"];
const WEIGHTED_TAGS: &[&str] = &["bIsWeighted", "BisWeighted"];
const BRAND_TAGS: &[&str] = &["ManufacturerName", "BrandName"];
const IMAGE_TAGS: &[&str] = &[
    "ItemImage",
    "Image",
    "ImageUrl",
    "ImageURL",
    "Picture",
    "PictureUrl",
    "Photo",
    "PhotoUrl",
    "תמונה",
    "קישור_תמונה",
];

/// A parsed XML element: name, accumulated text, children. Attributes
/// are irrelevant for these feeds and dropped.
#[derive(Debug, Default, Clone)]
pub struct Element {
    pub name: String,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// First non-empty text among direct children with one of the
    /// candidate names.
    fn first_text(&self, candidates: &[&str]) -> Option<&str> {
        for name in candidates {
            for child in &self.children {
                if child.name == *name {
                    let text = child.text.trim();
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
            }
        }
        None
    }

    /// Every descendant (not self) with the given name, document order.
    fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            }
            child.find_all(name, out);
        }
    }

    fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut out = Vec::new();
        self.find_all(name, &mut out);
        out
    }
}

/// Build the element tree for a whole document. The reader decodes per
/// the XML declaration, which matters for the Hebrew feeds.
pub fn parse_document(xml: &[u8]) -> Result<Element, anyhow::Error> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack = vec![Element::default()];
    loop {
        match reader.read_event_into(&mut buf).context("malformed xml")? {
            Event::Start(start) => {
                let name = reader
                    .decoder()
                    .decode(start.local_name().as_ref())?
                    .into_owned();
                stack.push(Element {
                    name,
                    ..Element::default()
                });
            }
            Event::Empty(start) => {
                let name = reader
                    .decoder()
                    .decode(start.local_name().as_ref())?
                    .into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Element {
                        name,
                        ..Element::default()
                    });
                }
            }
            Event::Text(text) => {
                if let Some(element) = stack.last_mut() {
                    element.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(cdata) => {
                if let Some(element) = stack.last_mut() {
                    element.text.push_str(&reader.decoder().decode(&cdata)?);
                }
            }
            Event::End(_) => {
                if stack.len() > 1 {
                    let element = stack.pop().unwrap_or_default();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(element);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if stack.len() != 1 {
        anyhow::bail!("unexpected end of document");
    }
    stack.pop().context("empty document")
}

/// One normalized price observation out of a price or promo file.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRow {
    pub barcode: String,
    pub name: Option<String>,
    pub price: f64,
    pub is_on_sale: bool,
    pub date: Option<String>,
    pub store_id: Option<String>,
    pub brand: Option<String>,
    pub unit: Option<String>,
    pub quantity: Option<f64>,
    pub is_weighted: bool,
    pub image_url: Option<String>,
}

/// One branch out of a stores file.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRow {
    pub external_id: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
}

/// Store identity some retailers embed in their price files, used to
/// enrich the store record during persistence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreMeta {
    pub store_id: Option<String>,
    pub name: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
}

fn owned(text: Option<&str>) -> Option<String> {
    text.map(ToString::to_string)
}

/// Parse a stores file into branch rows. Parse failures degrade to an
/// empty list; the file is worth skipping, not the run.
pub fn parse_stores(xml: &[u8]) -> Vec<StoreRow> {
    let root = match parse_document(xml) {
        Ok(root) => root,
        Err(err) => {
            log::warn!("failed to parse stores xml: {err}");
            return Vec::new();
        }
    };
    let mut rows = Vec::new();
    for store in root.descendants("Store") {
        let external_id = match store.first_text(STORE_ID_TAGS) {
            Some(id) => id.to_string(),
            None => continue,
        };
        rows.push(StoreRow {
            external_id,
            name: owned(store.first_text(STORE_NAME_TAGS)),
            city: owned(store.first_text(CITY_TAGS)),
            address: owned(store.first_text(ADDRESS_TAGS)),
        });
    }
    rows
}

fn store_meta(root: &Element, store_id_hint: Option<&str>) -> StoreMeta {
    let mut meta = StoreMeta {
        store_id: owned(root.first_text(STORE_ID_TAGS)).or_else(|| owned(store_id_hint)),
        name: owned(root.first_text(STORE_NAME_TAGS)),
        city: owned(root.first_text(CITY_TAGS)),
        address: owned(root.first_text(ADDRESS_TAGS)),
    };
    // A <Store> block overrides root-level values when both exist.
    if let Some(store) = root.descendants("Store").first() {
        if let Some(id) = store.first_text(STORE_ID_TAGS) {
            meta.store_id = Some(id.to_string());
        }
        if let Some(name) = store.first_text(STORE_NAME_TAGS) {
            meta.name = Some(name.to_string());
        }
        if let Some(city) = store.first_text(CITY_TAGS) {
            meta.city = Some(city.to_string());
        }
        if let Some(address) = store.first_text(ADDRESS_TAGS) {
            meta.address = Some(address.to_string());
        }
    }
    meta
}

fn parse_weighted(text: Option<&str>) -> bool {
    matches!(
        text.map(str::to_lowercase).as_deref(),
        Some("1") | Some("true") | Some("y")
    )
}

/// Parse a price or promo file.
///
/// Promotions come first: every `<Item>` under a `<Promotion>` becomes an
/// on-sale row at the discounted price, typically without a name. Then
/// the flat `<Item>` list is walked with the promo-vs-regular decision
/// table: a promotional price only wins, and only marks the row on sale,
/// when it is strictly below the regular one.
pub fn parse_prices(xml: &[u8], store_id_hint: Option<&str>) -> (Vec<PriceRow>, StoreMeta) {
    let root = match parse_document(xml) {
        Ok(root) => root,
        Err(err) => {
            log::warn!("failed to parse prices xml: {err}");
            return (Vec::new(), StoreMeta::default());
        }
    };
    let meta = store_meta(&root, store_id_hint);
    let effective_store_id = meta.store_id.clone();
    let mut rows = Vec::new();

    for promo in root.descendants("Promotion") {
        let price = match promo
            .first_text(PROMO_DISCOUNT_TAGS)
            .and_then(|p| p.parse::<f64>().ok())
        {
            Some(price) => price,
            None => continue,
        };
        let date = owned(promo.first_text(PROMO_DATE_TAGS));
        for item in promo.descendants("Item") {
            let barcode = match item.first_text(BARCODE_TAGS) {
                Some(barcode) => barcode.to_string(),
                None => continue,
            };
            rows.push(PriceRow {
                barcode,
                name: None,
                price,
                is_on_sale: true,
                date: date.clone(),
                store_id: effective_store_id.clone(),
                brand: None,
                unit: None,
                quantity: None,
                is_weighted: false,
                image_url: owned(item.first_text(IMAGE_TAGS)),
            });
        }
    }

    let mut items = root.descendants("Item");
    if items.is_empty() {
        items = root.children.iter().collect();
    }
    for item in items {
        let barcode = match item.first_text(BARCODE_TAGS) {
            Some(barcode) => barcode.to_string(),
            None => continue,
        };
        let regular = item
            .first_text(REGULAR_PRICE_TAGS)
            .and_then(|p| p.parse::<f64>().ok());
        let promo = item
            .first_text(PROMO_PRICE_TAGS)
            .and_then(|p| p.parse::<f64>().ok());
        let (price, is_on_sale) = match (regular, promo) {
            (Some(regular), Some(promo)) if promo < regular => (promo, true),
            (Some(regular), Some(_)) => (regular, false),
            (None, Some(promo)) => (promo, true),
            (Some(regular), None) => (regular, false),
            (None, None) => continue,
        };
        let quantity = item
            .first_text(QUANTITY_TAGS)
            .and_then(|q| q.parse::<f64>().ok());
        rows.push(PriceRow {
            barcode,
            name: owned(item.first_text(ITEM_NAME_TAGS)),
            price,
            is_on_sale,
            date: owned(item.first_text(PRICE_DATE_TAGS)),
            store_id: effective_store_id.clone(),
            brand: owned(item.first_text(BRAND_TAGS)),
            unit: owned(item.first_text(UNIT_TAGS)),
            quantity,
            is_weighted: parse_weighted(item.first_text(WEIGHTED_TAGS)),
            image_url: owned(item.first_text(IMAGE_TAGS)),
        });
    }

    (rows, meta)
}

/// Store external id encoded in price filenames, e.g. `004` out of
/// `PriceFull7290027600007-004-202501140030.gz` (second dash group).
pub fn extract_store_id(filename: &str) -> Option<String> {
    regex!(r"(\d+)-(\d+)-\d+")
        .captures(filename)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// Stores files carry `Store` in the name without `Price`; everything
/// else is routed through the price parser.
pub fn is_store_file(filename: &str) -> bool {
    filename.contains("Store") && !filename.contains("Price")
}
