//! Typed client for the external game API.
//!
//! Thin over [`RateLimitedTransport`]: builds the URL, attaches the bearer
//! token on authenticated endpoints, maps non-2xx statuses to
//! [`Error::Api`] and decodes JSON bodies.

use crate::config::secrets::bearer_header;
use crate::error::{Error, Result};
use crate::model::esi::{
    Alliance, AllianceHistoryEntry, Character, Corporation, CorporationHistoryEntry, Killmail,
    KillmailRef, LoyaltyOffer, MarketHistoryEntry, MarketOrder, War,
};
use crate::transport::{ApiRequest, ApiResponse, RateLimitedTransport};
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use secrecy::SecretString;
use serde::de::DeserializeOwned;

const PAGES_HEADER: &str = "x-pages";
const EXPIRES_HEADER: &str = "expires";

/// A decoded response plus the cache metadata the callers need.
#[derive(Debug, Clone)]
pub struct EsiResponse<T> {
    pub data: T,
    /// Total page count, when the endpoint is paginated.
    pub pages: Option<u32>,
    /// When the upstream cache for this resource expires.
    pub expires: Option<DateTime<Utc>>,
}

pub struct EsiClient {
    transport: RateLimitedTransport,
    base_url: String,
    token: Option<SecretString>,
}

impl EsiClient {
    pub fn new(
        transport: RateLimitedTransport,
        base_url: impl Into<String>,
        token: Option<SecretString>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub async fn character(&self, character_id: i32) -> Result<EsiResponse<Character>> {
        self.get(ApiRequest::get(self.url(&format!("/v5/characters/{character_id}/"))))
            .await
    }

    pub async fn corporation_history(
        &self,
        character_id: i32,
    ) -> Result<EsiResponse<Vec<CorporationHistoryEntry>>> {
        let path = format!("/v1/characters/{character_id}/corporationhistory/");
        self.get(ApiRequest::get(self.url(&path))).await
    }

    pub async fn corporation(&self, corporation_id: i32) -> Result<EsiResponse<Corporation>> {
        self.get(ApiRequest::get(self.url(&format!("/v5/corporations/{corporation_id}/"))))
            .await
    }

    pub async fn alliance_history(
        &self,
        corporation_id: i32,
    ) -> Result<EsiResponse<Vec<AllianceHistoryEntry>>> {
        let path = format!("/v2/corporations/{corporation_id}/alliancehistory/");
        self.get(ApiRequest::get(self.url(&path))).await
    }

    pub async fn npc_corporations(&self) -> Result<EsiResponse<Vec<i32>>> {
        self.get(ApiRequest::get(self.url("/v2/corporations/npccorps/")))
            .await
    }

    pub async fn loyalty_offers(&self, corporation_id: i32) -> Result<EsiResponse<Vec<LoyaltyOffer>>> {
        let path = format!("/v1/loyalty/stores/{corporation_id}/offers/");
        self.get(ApiRequest::get(self.url(&path))).await
    }

    pub async fn alliances(&self) -> Result<EsiResponse<Vec<i32>>> {
        self.get(ApiRequest::get(self.url("/v2/alliances/"))).await
    }

    pub async fn alliance(&self, alliance_id: i32) -> Result<EsiResponse<Alliance>> {
        self.get(ApiRequest::get(self.url(&format!("/v4/alliances/{alliance_id}/"))))
            .await
    }

    pub async fn alliance_corporations(&self, alliance_id: i32) -> Result<EsiResponse<Vec<i32>>> {
        let path = format!("/v2/alliances/{alliance_id}/corporations/");
        self.get(ApiRequest::get(self.url(&path))).await
    }

    pub async fn region_orders(
        &self,
        region_id: i32,
        page: u32,
    ) -> Result<EsiResponse<Vec<MarketOrder>>> {
        let request = ApiRequest::get(self.url(&format!("/v1/markets/{region_id}/orders/")))
            .query("order_type", "all")
            .query("page", page);
        self.get(request).await
    }

    /// Orders in a player structure. Requires the access token.
    pub async fn structure_orders(
        &self,
        structure_id: i64,
        page: u32,
    ) -> Result<EsiResponse<Vec<MarketOrder>>> {
        let request = ApiRequest::get(self.url(&format!("/v1/markets/structures/{structure_id}/")))
            .query("page", page);
        let request = self.authorize(request)?;
        self.get(request).await
    }

    pub async fn killmail(&self, killmail_id: i32, hash: &str) -> Result<EsiResponse<Killmail>> {
        let path = format!("/v1/killmails/{killmail_id}/{hash}/");
        self.get(ApiRequest::get(self.url(&path))).await
    }

    pub async fn market_history(
        &self,
        region_id: i32,
        type_id: i32,
    ) -> Result<EsiResponse<Vec<MarketHistoryEntry>>> {
        let request = ApiRequest::get(self.url(&format!("/v1/markets/{region_id}/history/")))
            .query("type_id", type_id);
        self.get(request).await
    }

    /// Public structures that run a market.
    pub async fn market_structures(&self) -> Result<EsiResponse<Vec<i64>>> {
        let request =
            ApiRequest::get(self.url("/v1/universe/structures/")).query("filter", "market");
        self.get(request).await
    }

    /// The most recently declared wars, newest first.
    pub async fn wars(&self) -> Result<EsiResponse<Vec<i32>>> {
        self.get(ApiRequest::get(self.url("/v1/wars/"))).await
    }

    pub async fn war(&self, war_id: i32) -> Result<EsiResponse<War>> {
        self.get(ApiRequest::get(self.url(&format!("/v1/wars/{war_id}/"))))
            .await
    }

    pub async fn war_killmails(
        &self,
        war_id: i32,
        page: u32,
    ) -> Result<EsiResponse<Vec<KillmailRef>>> {
        let request = ApiRequest::get(self.url(&format!("/v1/wars/{war_id}/killmails/")))
            .query("page", page);
        self.get(request).await
    }

    pub async fn regions(&self) -> Result<EsiResponse<Vec<i32>>> {
        self.get(ApiRequest::get(self.url("/v1/universe/regions/")))
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: ApiRequest) -> Result<ApiRequest> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| Error::Config("ESI_ACCESS_TOKEN is required for this endpoint".into()))?;
        let value = bearer_header(token)
            .ok_or_else(|| Error::Config("ESI_ACCESS_TOKEN is not a valid header value".into()))?;
        Ok(request.header(AUTHORIZATION, value))
    }

    async fn get<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<EsiResponse<T>> {
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(|e| Error::Transport {
                url: request.url.clone(),
                message: e.to_string(),
            })?;

        if !response.is_success() {
            return Err(Error::Api {
                status: response.status,
                url: request.url,
            });
        }

        decode(&response)
    }
}

impl<T> EsiResponse<Vec<T>> {
    /// The page to request after `page`, or `None` once the listing is
    /// exhausted: at the advertised page total, otherwise at the first
    /// empty page.
    pub fn next_page(&self, page: u32) -> Option<u32> {
        match self.pages {
            Some(total) if page >= total => None,
            None if self.data.is_empty() => None,
            _ => Some(page + 1),
        }
    }
}

fn decode<T: DeserializeOwned>(response: &ApiResponse) -> Result<EsiResponse<T>> {
    let data = serde_json::from_slice(&response.body)?;
    let pages = response
        .header_str(PAGES_HEADER)
        .and_then(|v| v.trim().parse().ok());
    let expires = response
        .header_str(EXPIRES_HEADER)
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|d| d.with_timezone(&Utc));
    Ok(EsiResponse {
        data,
        pages,
        expires,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn response(body: &str, headers: &[(&'static str, &str)]) -> ApiResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        ApiResponse {
            status: 200,
            headers: map,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn decode_reads_pages_and_expires() {
        let resp = response(
            "[1, 2, 3]",
            &[
                ("x-pages", "4"),
                ("expires", "Fri, 16 Oct 2026 12:05:00 GMT"),
            ],
        );
        let decoded: EsiResponse<Vec<i32>> = decode(&resp).unwrap();
        assert_eq!(decoded.data, vec![1, 2, 3]);
        assert_eq!(decoded.pages, Some(4));
        assert_eq!(
            decoded.expires.unwrap().to_rfc3339(),
            "2026-10-16T12:05:00+00:00"
        );
    }

    #[test]
    fn decode_without_metadata() {
        let decoded: EsiResponse<Vec<i32>> = decode(&response("[]", &[])).unwrap();
        assert!(decoded.data.is_empty());
        assert_eq!(decoded.pages, None);
        assert_eq!(decoded.expires, None);
    }

    #[test]
    fn paging_stops_at_total_or_first_empty_page() {
        let paged: EsiResponse<Vec<i32>> = decode(&response("[1]", &[("x-pages", "3")])).unwrap();
        assert_eq!(paged.next_page(1), Some(2));
        assert_eq!(paged.next_page(3), None);

        let unpaged: EsiResponse<Vec<i32>> = decode(&response("[1]", &[])).unwrap();
        assert_eq!(unpaged.next_page(1), Some(2));
        let empty: EsiResponse<Vec<i32>> = decode(&response("[]", &[])).unwrap();
        assert_eq!(empty.next_page(2), None);
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let err = decode::<Vec<i32>>(&response("{not json", &[])).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
