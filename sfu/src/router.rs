use std::sync::Arc;

use confab::protocol::{MediaKind, RtpCapabilities, RtpCodec, RtpParameters};

use crate::{backend::RouterBackend, media_engine};

/// The media router of an SFU room. It decides which codecs a consumer receives.
#[derive(Clone)]
pub struct Router {
    pub id: String,
    capabilities: RtpCapabilities,
    backend: Arc<dyn RouterBackend>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("confab_sfu::Router")
            .field("id", &self.id)
            .finish()
    }
}

impl Router {
    pub fn new(backend: Arc<dyn RouterBackend>) -> Self {
        Self {
            id: backend.id().to_string(),
            capabilities: backend.rtp_capabilities(),
            backend,
        }
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    pub fn backend(&self) -> &dyn RouterBackend {
        self.backend.as_ref()
    }

    /// Producer parameters as the router forwards them. Producers that announce no codec get
    /// every router codec of their kind.
    pub fn producer_rtp_parameters(&self, kind: MediaKind, params: &RtpParameters) -> RtpParameters {
        if !params.codecs.is_empty() {
            return params.clone();
        }
        RtpParameters {
            mid: params.mid.clone(),
            codecs: self
                .capabilities
                .codecs
                .iter()
                .filter(|c| codec_kind_matches(c, kind))
                .cloned()
                .collect(),
            encodings: params.encodings.clone(),
        }
    }

    /// Parameters of a consumer of `producer` for a peer announcing `capabilities`, or `None`
    /// when the peer cannot decode any of the producer's codecs.
    pub fn consumer_rtp_parameters(
        &self,
        producer: &RtpParameters,
        capabilities: &RtpCapabilities,
    ) -> Option<RtpParameters> {
        let media: Vec<&RtpCodec> = producer
            .codecs
            .iter()
            .filter(|c| !media_engine::is_rtx(c))
            .filter(|c| {
                capabilities.codecs.iter().any(|cap| {
                    cap.mime_type.eq_ignore_ascii_case(&c.mime_type)
                        && cap.clock_rate == c.clock_rate
                })
            })
            .collect();
        let primary = media.first()?;

        let mut codecs = vec![(*primary).clone()];
        let apt = format!("apt={}", primary.payload_type);
        if capabilities.codecs.iter().any(media_engine::is_rtx) {
            codecs.extend(
                producer
                    .codecs
                    .iter()
                    .filter(|c| media_engine::is_rtx(c) && c.sdp_fmtp_line == apt)
                    .cloned(),
            );
        }

        Some(RtpParameters {
            mid: None,
            codecs,
            encodings: producer.encodings.clone(),
        })
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}

fn codec_kind_matches(codec: &RtpCodec, kind: MediaKind) -> bool {
    let prefix = if kind.is_video() { "video/" } else { "audio/" };
    codec
        .mime_type
        .get(..prefix.len())
        .map(|p| p.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}
