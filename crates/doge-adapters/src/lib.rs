//! Primary-source crawler, schema normalizer, and secondary-source parsers.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use doge_core::{cell_from_json, Category, Cell, RecordTable};
use doge_storage::{FetchError, PageFetcher, Throttle};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "doge-adapters";

pub const DEFAULT_API_ROOT: &str = "https://api.doge.gov/savings/";
pub const DEFAULT_USAS_API_ROOT: &str = "https://api.usaspending.gov/api/v2/awards/";
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Derived column the enrichment adds; the source's own field is namespaced.
const SOURCE_DESCRIPTION_COLUMN: &str = "description_doge";

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid endpoint url {url}: {detail}")]
    Url { url: String, detail: String },
    #[error("page {page} of {endpoint} is not valid json: {source}")]
    Json {
        endpoint: String,
        page: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error("page {page} of {endpoint} has unexpected shape: {detail}")]
    Shape {
        endpoint: String,
        page: u32,
        detail: String,
    },
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    pages: u32,
}

/// Request parameters for one endpoint crawl.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub api_root: String,
    pub endpoint: String,
    pub page_size: u32,
}

impl CrawlRequest {
    pub fn for_category(api_root: &str, category: Category, page_size: u32) -> Self {
        Self {
            api_root: api_root.to_string(),
            endpoint: category.endpoint().to_string(),
            page_size,
        }
    }

    pub fn page_url(&self, page: u32) -> Result<Url, CrawlError> {
        let root = if self.api_root.ends_with('/') {
            self.api_root.clone()
        } else {
            format!("{}/", self.api_root)
        };
        let mut url = Url::parse(&root)
            .and_then(|base| base.join(&self.endpoint))
            .map_err(|e| CrawlError::Url {
                url: format!("{root}{}", self.endpoint),
                detail: e.to_string(),
            })?;
        url.query_pairs_mut()
            .append_pair("sort_by", "date")
            .append_pair("sort_order", "desc")
            .append_pair("per_page", &self.page_size.to_string())
            .append_pair("page", &page.to_string());
        Ok(url)
    }
}

/// Fetches every page of an endpoint and returns one table of all records.
///
/// Page 1 is always requested; crawling stops once `page >= meta.pages`, so
/// an endpoint reporting zero pages yields whatever page 1 held (usually
/// nothing), never an error.
pub async fn crawl(fetcher: &dyn PageFetcher, request: &CrawlRequest) -> Result<RecordTable, CrawlError> {
    let mut records: Vec<Map<String, JsonValue>> = Vec::new();
    let mut page = 1u32;
    loop {
        let url = request.page_url(page)?;
        let response = fetcher.get(url.as_str(), Throttle::Limited).await?;
        let body: JsonValue = response.json().map_err(|source| CrawlError::Json {
            endpoint: request.endpoint.clone(),
            page,
            source,
        })?;
        let (page_records, pages) = split_page(&body, &request.endpoint).map_err(|detail| CrawlError::Shape {
            endpoint: request.endpoint.clone(),
            page,
            detail,
        })?;
        debug!(endpoint = %request.endpoint, page, pages, count = page_records.len(), "crawled page");
        records.extend(page_records);

        if page >= pages {
            break;
        }
        page += 1;
    }

    let mut table = RecordTable::from_json_records(&records);
    table.rename_column("description", SOURCE_DESCRIPTION_COLUMN);
    info!(endpoint = %request.endpoint, rows = table.len(), pages = page, "crawl complete");
    Ok(table)
}

fn split_page(body: &JsonValue, endpoint: &str) -> Result<(Vec<Map<String, JsonValue>>, u32), String> {
    let items = body
        .get("result")
        .and_then(|r| r.get(endpoint))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| format!("missing result.{endpoint} array"))?;
    let meta: PageMeta = body
        .get("meta")
        .cloned()
        .ok_or_else(|| "missing meta".to_string())
        .and_then(|m| serde_json::from_value(m).map_err(|e| format!("bad meta: {e}")))?;
    let records = items
        .iter()
        .map(|item| {
            item.as_object()
                .cloned()
                .ok_or_else(|| format!("non-object entry in result.{endpoint}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((records, meta.pages))
}

/// Lower-cases a column name and turns spaces into underscores.
pub fn canonical_column_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%m/%d/%y", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y", "%d %B %Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

/// Best-effort date parse; anything unrecognised is `None`.
pub fn parse_loose_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocationParts {
    pub city: Cell,
    pub state: Cell,
    pub agency: Cell,
}

/// Splits `"City, ST[, Agency]"`. When the second token is not a two-letter
/// state code, state is empty and the tokens after the city shift left.
///
/// `agency` is only set when the location has a third token; otherwise the
/// row's own agency stands.
pub fn split_location(raw: Option<&str>) -> LocationParts {
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return LocationParts::default();
    };
    let parts: Vec<&str> = raw.split(", ").collect();
    let city = parts.first().map(|s| s.to_string());
    let is_state = parts.get(1).is_some_and(|second| second.chars().count() == 2);
    let agency = if parts.len() > 2 {
        let token = if is_state { parts[2] } else { parts[1] };
        Some(token.to_string())
    } else {
        None
    };
    LocationParts {
        city,
        state: Some(if is_state { parts[1].to_string() } else { String::new() }),
        agency,
    }
}

/// Maps a freshly scraped table into the comparison schema. Never fails.
pub fn normalize(mut table: RecordTable) -> RecordTable {
    table.rename_columns_with(canonical_column_name);

    let uploaded_dates: Option<Vec<Cell>> = table.column_values("uploaded_on").map(|values| {
        values
            .into_iter()
            .map(|v| v.and_then(parse_loose_date).map(|d| d.format("%Y-%m-%d").to_string()))
            .collect()
    });
    if let Some(dates) = uploaded_dates {
        let mut dates = dates.into_iter();
        table.map_column("uploaded_dt", |_| dates.next().flatten());
    }

    let locations: Option<Vec<LocationParts>> = table
        .column_values("location")
        .map(|values| values.into_iter().map(split_location).collect());
    if let Some(split) = locations {
        let mut city = split.iter().map(|p| p.city.clone());
        table.map_column("city", |_| city.next().flatten());
        let mut state = split.iter().map(|p| p.state.clone());
        table.map_column("state", |_| state.next().flatten());
        let mut agency = split.iter().map(|p| p.agency.clone());
        table.map_column("agency", |existing| {
            agency
                .next()
                .flatten()
                .or_else(|| existing.map(ToString::to_string))
        });
    }

    for link_column in ["link", "fpds_link"] {
        if table.has_column(link_column) {
            table.map_column(link_column, |v| Some(v.unwrap_or_default().to_string()));
        }
    }

    if table.has_column("vendor") {
        table.map_column("vendor", |v| match v {
            Some("N/A") => Some(String::new()),
            other => other.map(ToString::to_string),
        });
    }

    table
}

/// True for absolute http(s) URLs with a host.
pub fn is_usable_link(link: &str) -> bool {
    match Url::parse(link.trim()) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some_and(|h| h.contains('.')),
        Err(_) => false,
    }
}

/// Last non-empty path segment of a link, taken as the award identifier.
pub fn record_id_from_link(link: &str) -> Option<String> {
    let url = Url::parse(link.trim()).ok()?;
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(ToString::to_string)
}

pub fn award_api_url(api_root: &str, record_id: &str) -> String {
    format!("{}/{}", api_root.trim_end_matches('/'), record_id)
}

/// Output column -> input element id on the procurement award page.
pub const FPDS_FIELDS: &[(&str, &str)] = &[
    ("award_agency", "agencyID"),
    ("award_procurement_id", "PIID"),
    ("award_modification_num", "modNumber"),
    ("ref_idv_agency", "idvAgencyID"),
    ("ref_idv_procurement_id", "idvPIID"),
    ("ref_idv_modification_num", "idvModNumber"),
    ("date_signed", "signedDate"),
    ("date_effective", "effectiveDate"),
    ("date_complete", "awardCompletionDate"),
    ("date_ult_complete_est", "estimatedUltimateCompletionDate"),
    ("date_solicitation", "solicitationDate"),
    ("amount_obligated", "obligatedAmount"),
    ("amount_obligated_total", "totalObligatedAmount"),
    ("amount_base_exercised_options", "baseAndExercisedOptionsValue"),
    ("amount_base_exercised_options_total", "totalBaseAndExercisedOptionsValue"),
    ("amount_ultimate", "ultimateContractValue"),
    ("amount_ultimate_total", "totalUltimateContractValue"),
    ("entity_id", "UEINumber"),
    ("entity_name", "vendorName"),
    ("entity_dba", "vendorDoingAsBusinessName"),
    ("cage_code", "cageCode"),
    ("entity_street", "vendorStreet"),
    ("entity_street_2", "vendorStreet2"),
    ("entity_city", "vendorCity"),
    ("entity_state", "vendorState"),
    ("entity_zip", "vendorZip"),
    ("entity_county", "vendorCountry"),
    ("entity_county_disp", "vendorCountryForDisplay"),
    ("entity_phone", "vendorPhone"),
    ("entity_fax", "vendorFax"),
    ("entity_congressional_district", "vendorCongressionalDistrict"),
    ("product_service_code", "productOrServiceCode"),
    ("product_service_desc", "productOrServiceCodeDescription"),
    ("principal_naics_code", "principalNAICSCode"),
    ("principal_naics_desc", "NAICSCodeDescription"),
    ("performance_state", "placeStateCode"),
    ("performance_location", "placeLocationCode"),
    ("performance_country", "placeCountryCode"),
    ("performance_county", "principalPlaceOfPerformanceCountyName"),
    ("performance_city", "principalPlaceOfPerformanceName"),
    ("performance_congressional_district", "principalPlaceOfPerformanceCongressionalDistrict"),
    ("performance_zip", "placeOfPerformanceZIPCode"),
    ("performance_zip_ext", "placeOfPerformanceZIPCode4"),
];

pub const FPDS_REQUIREMENT_COLUMN: &str = "requirement_desc";
const FPDS_REQUIREMENT_ELEMENT: &str = "descriptionOfContractRequirement";

/// Every column contract enrichment produces, in output order.
pub fn fpds_columns() -> Vec<String> {
    FPDS_FIELDS
        .iter()
        .map(|(column, _)| column.to_string())
        .chain(std::iter::once(FPDS_REQUIREMENT_COLUMN.to_string()))
        .collect()
}

/// `"$1,234.50"` -> `1234.5`.
pub fn parse_currency(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

fn id_selector(element: &str, id: &str) -> Option<Selector> {
    Selector::parse(&format!(r#"{element}[id="{id}"]"#)).ok()
}

/// Pulls the fixed field dictionary out of a procurement award page.
/// Missing inputs and unparseable amounts come back null.
pub fn parse_fpds_html(html: &str) -> Vec<(String, Cell)> {
    let document = Html::parse_document(html);
    let mut out = Vec::with_capacity(FPDS_FIELDS.len() + 1);

    for (column, element_id) in FPDS_FIELDS {
        let value = id_selector("input", element_id)
            .and_then(|sel| document.select(&sel).next())
            .and_then(|node| node.value().attr("value"))
            .map(|v| v.trim().to_string());
        let value = if column.starts_with("amount") {
            value.and_then(|v| {
                let parsed = parse_currency(&v);
                if parsed.is_none() && !v.is_empty() {
                    debug!(column, raw = %v, "unparseable amount");
                }
                parsed.map(|f| f.to_string())
            })
        } else {
            value
        };
        out.push((column.to_string(), value));
    }

    let requirement = id_selector("textarea", FPDS_REQUIREMENT_ELEMENT)
        .and_then(|sel| document.select(&sel).next())
        .map(|node| node.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty());
    out.push((FPDS_REQUIREMENT_COLUMN.to_string(), requirement));
    out
}

/// Flattens nested objects into dot-joined keys. Arrays stay as JSON text.
pub fn flatten_json(value: &JsonValue) -> Vec<(String, Cell)> {
    let mut out = Vec::new();
    if let JsonValue::Object(map) = value {
        flatten_into(map, None, &mut out);
    }
    out
}

fn flatten_into(map: &Map<String, JsonValue>, prefix: Option<&str>, out: &mut Vec<(String, Cell)>) {
    for (key, value) in map {
        let name = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            JsonValue::Object(inner) if !inner.is_empty() => flatten_into(inner, Some(name.as_str()), out),
            JsonValue::Object(_) => out.push((name, None)),
            other => out.push((name, cell_from_json(other))),
        }
    }
}

/// Flattened award payload with its top-level `description` namespaced.
pub fn parse_award_json(value: &JsonValue) -> Vec<(String, Cell)> {
    flatten_json(value)
        .into_iter()
        .map(|(key, cell)| {
            if key == "description" {
                ("description_usas".to_string(), cell)
            } else {
                (key, cell)
            }
        })
        .collect()
}
