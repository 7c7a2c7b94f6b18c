//! The Automation RPC surface
//!
//! Once the session is `Connected`, calls are JSON requests tunneled to
//! the automation page through `_rpc_forwardSocketData:`.

use std::time::Duration;

use base64::Engine;
use serde_json::json;

use crate::MuxdevError;

use super::WebInspector;

/// Default page load timeout for navigations
const DEFAULT_PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// A Safari browsing context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    /// The browsing context handle
    pub id: String,
    /// Current URL
    pub url: String,
    /// Whether this context is frontmost
    pub active: bool,
}

impl WebInspector {
    /// Opens a new browsing context
    ///
    /// # Returns
    /// The new context's handle
    pub async fn create_page(&self) -> Result<String, MuxdevError> {
        let res = self
            .automation_request("createBrowsingContext", json!({}))
            .await?;
        match res.get("handle").and_then(|x| x.as_str()) {
            Some(handle) => Ok(handle.to_owned()),
            None => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Lists the open browsing contexts
    pub async fn list_pages(&self) -> Result<Vec<Page>, MuxdevError> {
        let res = self
            .automation_request("getBrowsingContexts", json!({}))
            .await?;
        let contexts = match res.get("contexts").and_then(|x| x.as_array()) {
            Some(c) => c,
            None => return Err(MuxdevError::UnexpectedResponse),
        };

        let mut pages = Vec::with_capacity(contexts.len());
        for context in contexts {
            pages.push(Page {
                id: context
                    .get("handle")
                    .or_else(|| context.get("id"))
                    .and_then(|x| x.as_str())
                    .ok_or(MuxdevError::UnexpectedResponse)?
                    .to_owned(),
                url: context
                    .get("url")
                    .and_then(|x| x.as_str())
                    .unwrap_or_default()
                    .to_owned(),
                active: context
                    .get("active")
                    .and_then(|x| x.as_bool())
                    .unwrap_or(false),
            });
        }
        Ok(pages)
    }

    /// Navigates a browsing context to a URL
    ///
    /// # Arguments
    /// * `handle` - The browsing context
    /// * `url` - Where to go
    /// * `page_load_timeout` - Remote-side load timeout, default 30 s
    pub async fn navigate(
        &self,
        handle: &str,
        url: &str,
        page_load_timeout: Option<Duration>,
    ) -> Result<(), MuxdevError> {
        let timeout = page_load_timeout.unwrap_or(DEFAULT_PAGE_LOAD_TIMEOUT);
        self.automation_request(
            "navigateBrowsingContext",
            json!({
                "handle": handle,
                "url": url,
                "pageLoadTimeout": timeout.as_millis() as u64,
            }),
        )
        .await?;
        Ok(())
    }

    /// Brings a browsing context (and its top-level frame) to the front
    pub async fn switch_to(&self, handle: &str) -> Result<(), MuxdevError> {
        self.automation_request(
            "switchToBrowsingContext",
            json!({
                "browsingContextHandle": handle,
                "frameHandle": "",
            }),
        )
        .await?;
        Ok(())
    }

    /// Takes a screenshot of a browsing context
    ///
    /// # Returns
    /// PNG bytes
    pub async fn screenshot(&self, handle: &str) -> Result<Vec<u8>, MuxdevError> {
        let res = self
            .automation_request(
                "takeScreenshot",
                json!({
                    "handle": handle,
                    "scrollIntoViewIfNeeded": true,
                    "clipToViewport": true,
                }),
            )
            .await?;
        let data = match res.get("data").and_then(|x| x.as_str()) {
            Some(d) => d,
            None => return Err(MuxdevError::UnexpectedResponse),
        };
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|_| MuxdevError::UnexpectedResponse)
    }

    /// History back
    pub async fn go_back(&self, handle: &str) -> Result<(), MuxdevError> {
        self.automation_request("goBackInBrowsingContext", json!({ "handle": handle }))
            .await?;
        Ok(())
    }

    /// History forward
    pub async fn go_forward(&self, handle: &str) -> Result<(), MuxdevError> {
        self.automation_request("goForwardInBrowsingContext", json!({ "handle": handle }))
            .await?;
        Ok(())
    }

    /// Reloads a browsing context
    pub async fn reload(&self, handle: &str) -> Result<(), MuxdevError> {
        self.automation_request("reloadBrowsingContext", json!({ "handle": handle }))
            .await?;
        Ok(())
    }

    /// Closes a browsing context
    pub async fn close_page(&self, handle: &str) -> Result<(), MuxdevError> {
        self.automation_request("closeBrowsingContext", json!({ "handle": handle }))
            .await?;
        Ok(())
    }
}
