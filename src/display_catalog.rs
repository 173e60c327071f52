//! C5: REST query against the DisplayCatalog service for MSIX/AppX product
//! listings.

use crate::http::{Header, MsHttpClient};
use crate::Error;
use serde_json::Value;

/// DisplayCatalog environment to query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Production,
    Int,
}

impl Endpoint {
    fn base_url(self) -> &'static str {
        match self {
            Self::Production => "https://displaycatalog.mp.microsoft.com/v7.0/products",
            Self::Int => "https://displaycatalog-int.mp.microsoft.com/v7.0/products",
        }
    }
}

/// The response from a DisplayCatalog query, after singular-`Product`
/// promotion.
#[derive(Clone, Debug)]
pub struct DisplayCatalogResult {
    pub raw: Value,
}

impl DisplayCatalogResult {
    /// `IsFound` iff `Products` is a non-empty array.
    pub fn is_found(&self) -> bool {
        self.products().map(|p| !p.is_empty()).unwrap_or(false)
    }

    pub fn products(&self) -> Option<&Vec<Value>> {
        self.raw.get("Products")?.as_array()
    }

    /// `DisplaySkuAvailabilities[0].Sku.Properties.FulfillmentData.WuCategoryId`
    /// of the first product, if present.
    pub fn wu_category_id(&self) -> Option<&str> {
        let product = self.products()?.first()?;
        product
            .get("DisplaySkuAvailabilities")?
            .as_array()?
            .first()?
            .get("Sku")?
            .get("Properties")?
            .get("FulfillmentData")?
            .get("WuCategoryId")?
            .as_str()
    }

    /// `Products[0].LocalizedProperties[0]`, the market/language-selected
    /// title, publisher, and description block.
    pub fn localized_properties(&self) -> Option<&Value> {
        self.products()?
            .first()?
            .get("LocalizedProperties")?
            .as_array()?
            .first()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.localized_properties()?.get("ProductTitle")?.as_str()
    }

    pub fn publisher(&self) -> Option<&str> {
        self.localized_properties()?.get("PublisherName")?.as_str()
    }

    pub fn description(&self) -> Option<&str> {
        self.localized_properties()?
            .get("ProductDescription")?
            .as_str()
    }

    /// `Products[0].Properties.Category`, falling back to the first SKU's
    /// `Properties.Category` when the product-level field is absent.
    pub fn category(&self) -> Option<&str> {
        let product = self.products()?.first()?;
        product
            .get("Properties")
            .and_then(|p| p.get("Category"))
            .and_then(|v| v.as_str())
            .or_else(|| {
                product
                    .get("DisplaySkuAvailabilities")?
                    .as_array()?
                    .first()?
                    .get("Sku")?
                    .get("Properties")?
                    .get("Category")?
                    .as_str()
            })
    }

    /// `DisplaySkuAvailabilities[0].Availabilities[0].OrderManagementData.Price.ListPrice`
    /// of the first product, if present.
    pub fn price(&self) -> Option<f64> {
        self.products()?
            .first()?
            .get("DisplaySkuAvailabilities")?
            .as_array()?
            .first()?
            .get("Availabilities")?
            .as_array()?
            .first()?
            .get("OrderManagementData")?
            .get("Price")?
            .get("ListPrice")?
            .as_f64()
    }

    /// A product is free when it carries no list price at all, or the
    /// list price is exactly zero.
    pub fn is_free(&self) -> bool {
        self.price().map(|p| p <= 0.0).unwrap_or(true)
    }
}

pub struct DisplayCatalogClient<'a> {
    http: &'a MsHttpClient,
}

impl<'a> DisplayCatalogClient<'a> {
    pub fn new(http: &'a MsHttpClient) -> Self {
        Self { http }
    }

    pub fn query(
        &self,
        product_id: &str,
        market: &str,
        language: &str,
        endpoint: Endpoint,
    ) -> Result<DisplayCatalogResult, Error> {
        let url = format!(
            "{}/{product_id}?market={market}&languages={language}-{market},{language},neutral",
            endpoint.base_url()
        );

        let response = self
            .http
            .get(&url, &[Header("Accept", "application/json")])?;

        if response.status == 404 {
            return Ok(DisplayCatalogResult {
                raw: serde_json::json!({ "Products": [] }),
            });
        }

        let mut raw: Value = response.json()?;
        promote_singular_product(&mut raw);

        Ok(DisplayCatalogResult { raw })
    }
}

/// If the response contains a singular `Product` object but not a
/// `Products` array, promote it into a single-element array.
fn promote_singular_product(raw: &mut Value) {
    let Some(obj) = raw.as_object_mut() else {
        return;
    };
    if obj.contains_key("Products") {
        return;
    }
    if let Some(product) = obj.remove("Product") {
        obj.insert("Products".to_string(), Value::Array(vec![product]));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn promotes_singular_product() {
        let mut raw = serde_json::json!({ "Product": { "ProductId": "abc" } });
        promote_singular_product(&mut raw);
        let products = raw.get("Products").unwrap().as_array().unwrap();
        assert_eq!(products.len(), 1);
    }

    #[test]
    fn leaves_existing_products_array_alone() {
        let mut raw = serde_json::json!({ "Products": [{"a": 1}, {"a": 2}] });
        promote_singular_product(&mut raw);
        assert_eq!(raw.get("Products").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn is_found_reflects_nonempty_products() {
        let found = DisplayCatalogResult {
            raw: serde_json::json!({ "Products": [{"a": 1}] }),
        };
        assert!(found.is_found());

        let not_found = DisplayCatalogResult {
            raw: serde_json::json!({ "Products": [] }),
        };
        assert!(!not_found.is_found());
    }

    #[test]
    fn extracts_wu_category_id() {
        let result = DisplayCatalogResult {
            raw: serde_json::json!({
                "Products": [{
                    "DisplaySkuAvailabilities": [{
                        "Sku": {
                            "Properties": {
                                "FulfillmentData": { "WuCategoryId": "11111111-2222-3333-4444-555555555555" }
                            }
                        }
                    }]
                }]
            }),
        };
        assert_eq!(
            result.wu_category_id(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }
}
