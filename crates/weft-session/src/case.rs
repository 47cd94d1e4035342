//! CASE session establishment
//!
//! The Sigma1/Sigma2/Sigma3 authenticated key exchange between two fabric
//! members, plus the Sigma2Resume shortcut. Each run owns its messenger,
//! nonces and ephemeral keys exclusively; several exchanges may proceed in
//! parallel against one session manager.

use crate::exchange::{ExchangeMessage, RetransmissionConfig, PROTOCOL_SECURE_CHANNEL};
use crate::fabric::Fabric;
use crate::messenger::{
    msg_type, protocol_status, SecureChannelMessenger, DEFAULT_EXPECTED_PROCESSING_TIME,
    HEAVY_CRYPTO_PROCESSING_TIME,
};
use crate::session::{ResumptionRecord, SecureSession, SessionManager, SessionParameters};
use std::sync::Arc;
use tracing::{debug, info};
use weft_core::crypto::{self, EphemeralKeyExchange, KeyPair};
use weft_core::tlv::{Tag, TlvElement};
use weft_core::types::{NodeId, SessionId};
use weft_core::{Error, Result};

const SIGMA2_INFO: &[u8] = b"Sigma2";
const SIGMA3_INFO: &[u8] = b"Sigma3";
const SIGMA1_RESUME_INFO: &[u8] = b"Sigma1_Resume";
const SIGMA2_RESUME_INFO: &[u8] = b"Sigma2_Resume";

const NONCE_SIGMA2: &[u8; 13] = b"NCASE_Sigma2N";
const NONCE_SIGMA3: &[u8; 13] = b"NCASE_Sigma3N";
const NONCE_RESUME_1: &[u8; 13] = b"NCASE_SigmaS1";
const NONCE_RESUME_2: &[u8; 13] = b"NCASE_SigmaS2";

// =============================================================================
// MESSAGE CODECS
// =============================================================================

fn session_params_to_tlv(tag: Tag, params: &SessionParameters) -> TlvElement {
    TlvElement::structure(
        tag,
        vec![
            TlvElement::unsigned(Tag::Context(1), params.session_idle_interval_ms as u64),
            TlvElement::unsigned(Tag::Context(2), params.session_active_interval_ms as u64),
            TlvElement::unsigned(Tag::Context(3), params.session_active_threshold_ms as u64),
        ],
    )
}

fn session_params_from_tlv(element: &TlvElement) -> Result<SessionParameters> {
    let mut params = SessionParameters::default();
    if let Some(v) = element.field(1) {
        params.session_idle_interval_ms = v.as_unsigned()? as u32;
    }
    if let Some(v) = element.field(2) {
        params.session_active_interval_ms = v.as_unsigned()? as u32;
    }
    if let Some(v) = element.field(3) {
        params.session_active_threshold_ms = v.as_unsigned()? as u16;
    }
    Ok(params)
}

fn fixed_bytes<const N: usize>(element: &TlvElement, what: &str) -> Result<[u8; N]> {
    let bytes = element.as_bytes()?;
    bytes
        .try_into()
        .map_err(|_| Error::UnexpectedData(format!("{what} must be {N} bytes")))
}

/// The data both sides sign: own credentials plus both ephemeral keys,
/// signer's first.
fn tbs_bytes(
    noc: &[u8],
    icac: Option<&[u8]>,
    signer_ephemeral_key: &[u8],
    peer_ephemeral_key: &[u8],
) -> Vec<u8> {
    let mut fields = vec![TlvElement::bytes(Tag::Context(1), noc.to_vec())];
    if let Some(icac) = icac {
        fields.push(TlvElement::bytes(Tag::Context(2), icac.to_vec()));
    }
    fields.push(TlvElement::bytes(
        Tag::Context(3),
        signer_ephemeral_key.to_vec(),
    ));
    fields.push(TlvElement::bytes(
        Tag::Context(4),
        peer_ephemeral_key.to_vec(),
    ));
    TlvElement::structure(Tag::Anonymous, fields).encode()
}

fn tbe_bytes(noc: &[u8], icac: Option<&[u8]>, signature: &[u8], resumption_id: Option<&[u8; 16]>) -> Vec<u8> {
    let mut fields = vec![TlvElement::bytes(Tag::Context(1), noc.to_vec())];
    if let Some(icac) = icac {
        fields.push(TlvElement::bytes(Tag::Context(2), icac.to_vec()));
    }
    fields.push(TlvElement::bytes(Tag::Context(3), signature.to_vec()));
    if let Some(resumption_id) = resumption_id {
        fields.push(TlvElement::bytes(Tag::Context(4), resumption_id.to_vec()));
    }
    TlvElement::structure(Tag::Anonymous, fields).encode()
}

struct TbeData {
    noc: Vec<u8>,
    icac: Option<Vec<u8>>,
    signature: Vec<u8>,
    resumption_id: Option<[u8; 16]>,
}

fn decode_tbe(bytes: &[u8]) -> Result<TbeData> {
    let root = TlvElement::decode(bytes)?;
    Ok(TbeData {
        noc: root.expect_field(1)?.as_bytes()?.to_vec(),
        icac: match root.field(2) {
            Some(f) => Some(f.as_bytes()?.to_vec()),
            None => None,
        },
        signature: root.expect_field(3)?.as_bytes()?.to_vec(),
        resumption_id: match root.field(4) {
            Some(f) => Some(fixed_bytes(f, "resumption id")?),
            None => None,
        },
    })
}

struct Sigma1 {
    initiator_random: [u8; 32],
    initiator_session_id: u16,
    destination_id: [u8; 32],
    initiator_ephemeral_key: Vec<u8>,
    initiator_session_params: Option<SessionParameters>,
    resumption_id: Option<[u8; 16]>,
    initiator_resume_mic: Option<Vec<u8>>,
}

impl Sigma1 {
    fn to_tlv(&self) -> TlvElement {
        let mut fields = vec![
            TlvElement::bytes(Tag::Context(1), self.initiator_random.to_vec()),
            TlvElement::unsigned(Tag::Context(2), self.initiator_session_id as u64),
            TlvElement::bytes(Tag::Context(3), self.destination_id.to_vec()),
            TlvElement::bytes(Tag::Context(4), self.initiator_ephemeral_key.clone()),
        ];
        if let Some(params) = &self.initiator_session_params {
            fields.push(session_params_to_tlv(Tag::Context(5), params));
        }
        if let Some(resumption_id) = &self.resumption_id {
            fields.push(TlvElement::bytes(Tag::Context(6), resumption_id.to_vec()));
        }
        if let Some(mic) = &self.initiator_resume_mic {
            fields.push(TlvElement::bytes(Tag::Context(7), mic.clone()));
        }
        TlvElement::structure(Tag::Anonymous, fields)
    }

    fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        Ok(Self {
            initiator_random: fixed_bytes(root.expect_field(1)?, "initiator random")?,
            initiator_session_id: root.expect_field(2)?.as_unsigned()? as u16,
            destination_id: fixed_bytes(root.expect_field(3)?, "destination id")?,
            initiator_ephemeral_key: root.expect_field(4)?.as_bytes()?.to_vec(),
            initiator_session_params: match root.field(5) {
                Some(f) => Some(session_params_from_tlv(f)?),
                None => None,
            },
            resumption_id: match root.field(6) {
                Some(f) => Some(fixed_bytes(f, "resumption id")?),
                None => None,
            },
            initiator_resume_mic: match root.field(7) {
                Some(f) => Some(f.as_bytes()?.to_vec()),
                None => None,
            },
        })
    }
}

struct Sigma2 {
    responder_random: [u8; 32],
    responder_session_id: u16,
    responder_ephemeral_key: Vec<u8>,
    encrypted2: Vec<u8>,
    responder_session_params: Option<SessionParameters>,
}

impl Sigma2 {
    fn to_tlv(&self) -> TlvElement {
        let mut fields = vec![
            TlvElement::bytes(Tag::Context(1), self.responder_random.to_vec()),
            TlvElement::unsigned(Tag::Context(2), self.responder_session_id as u64),
            TlvElement::bytes(Tag::Context(3), self.responder_ephemeral_key.clone()),
            TlvElement::bytes(Tag::Context(4), self.encrypted2.clone()),
        ];
        if let Some(params) = &self.responder_session_params {
            fields.push(session_params_to_tlv(Tag::Context(5), params));
        }
        TlvElement::structure(Tag::Anonymous, fields)
    }

    fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        Ok(Self {
            responder_random: fixed_bytes(root.expect_field(1)?, "responder random")?,
            responder_session_id: root.expect_field(2)?.as_unsigned()? as u16,
            responder_ephemeral_key: root.expect_field(3)?.as_bytes()?.to_vec(),
            encrypted2: root.expect_field(4)?.as_bytes()?.to_vec(),
            responder_session_params: match root.field(5) {
                Some(f) => Some(session_params_from_tlv(f)?),
                None => None,
            },
        })
    }
}

struct Sigma2Resume {
    resumption_id: [u8; 16],
    resume_mic: Vec<u8>,
    responder_session_id: u16,
}

impl Sigma2Resume {
    fn to_tlv(&self) -> TlvElement {
        TlvElement::structure(
            Tag::Anonymous,
            vec![
                TlvElement::bytes(Tag::Context(1), self.resumption_id.to_vec()),
                TlvElement::bytes(Tag::Context(2), self.resume_mic.clone()),
                TlvElement::unsigned(Tag::Context(3), self.responder_session_id as u64),
            ],
        )
    }

    fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let root = TlvElement::decode(bytes)?;
        Ok(Self {
            resumption_id: fixed_bytes(root.expect_field(1)?, "resumption id")?,
            resume_mic: root.expect_field(2)?.as_bytes()?.to_vec(),
            responder_session_id: root.expect_field(3)?.as_unsigned()? as u16,
        })
    }
}

// =============================================================================
// KEY DERIVATION HELPERS
// =============================================================================

fn derive_key_16(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 16]> {
    let mut key = [0u8; 16];
    crypto::hkdf_sha256(salt, ikm, info, &mut key).map_err(Error::Crypto)?;
    Ok(key)
}

fn resume_key(
    shared_secret: &[u8],
    initiator_random: &[u8; 32],
    resumption_id: &[u8; 16],
    info: &[u8],
) -> Result<[u8; 16]> {
    let mut salt = Vec::with_capacity(48);
    salt.extend_from_slice(initiator_random);
    salt.extend_from_slice(resumption_id);
    derive_key_16(&salt, shared_secret, info)
}

fn sigma_salt(ipk: &[u8; 16], middle: &[u8], transcript_hash: &[u8; 32]) -> Vec<u8> {
    let mut salt = Vec::with_capacity(16 + middle.len() + 32);
    salt.extend_from_slice(ipk);
    salt.extend_from_slice(middle);
    salt.extend_from_slice(transcript_hash);
    salt
}

fn resume_session_salt(initiator_random: &[u8; 32], resumption_id: &[u8; 16]) -> Vec<u8> {
    let mut salt = Vec::with_capacity(48);
    salt.extend_from_slice(initiator_random);
    salt.extend_from_slice(resumption_id);
    salt
}

fn transcript_hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut all = Vec::new();
    for part in parts {
        all.extend_from_slice(part);
    }
    crypto::sha256(&all)
}

// =============================================================================
// INITIATOR
// =============================================================================

/// CASE initiator.
pub struct CaseClient {
    sessions: Arc<SessionManager>,
    retransmission: RetransmissionConfig,
}

impl CaseClient {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            retransmission: RetransmissionConfig::default(),
        }
    }

    pub fn with_retransmission(mut self, config: RetransmissionConfig) -> Self {
        self.retransmission = config;
        self
    }

    /// Establish a session with `peer_node_id` over the messenger.
    ///
    /// On any failure that is not a transport error or abort, a StatusReport
    /// with InvalidParam is sent before the error is surfaced.
    pub async fn establish(
        &self,
        messenger: &mut SecureChannelMessenger,
        fabric: &Fabric,
        peer_node_id: NodeId,
    ) -> Result<Arc<SecureSession>> {
        match self.run(messenger, fabric, peer_node_id).await {
            Ok(session) => Ok(session),
            Err(err) => {
                if !err.suppresses_status_report() {
                    let _ = messenger.send_error(protocol_status::INVALID_PARAM).await;
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        messenger: &mut SecureChannelMessenger,
        fabric: &Fabric,
        peer_node_id: NodeId,
    ) -> Result<Arc<SecureSession>> {
        let initiator_random = crypto::random_bytes::<32>();
        let initiator_session_id = self.sessions.allocate_session_id();
        let ephemeral = EphemeralKeyExchange::new();
        let ephemeral_public = ephemeral.public_key();
        let ipk = fabric.operational_identity_protection_key();

        let record = self
            .sessions
            .find_resumption_record(fabric.fabric_index, peer_node_id);
        let (resumption_id, resume_mic) = match &record {
            Some(record) => {
                let key = resume_key(
                    &record.shared_secret,
                    &initiator_random,
                    &record.resumption_id,
                    SIGMA1_RESUME_INFO,
                )?;
                let mic = crypto::aes128_ccm_encrypt(&key, NONCE_RESUME_1, &[], &[])
                    .map_err(Error::Crypto)?;
                (Some(record.resumption_id), Some(mic))
            }
            None => (None, None),
        };

        let sigma1 = Sigma1 {
            initiator_random,
            initiator_session_id: initiator_session_id.0,
            destination_id: fabric.destination_id(&initiator_random, peer_node_id)?,
            initiator_ephemeral_key: ephemeral_public.to_vec(),
            initiator_session_params: Some(SessionParameters::default()),
            resumption_id,
            initiator_resume_mic: resume_mic,
        };
        let sigma1_bytes = sigma1.to_tlv().encode();

        debug!(peer = %peer_node_id, resume = record.is_some(), "sending Sigma1");
        let response = messenger
            .exchange()
            .send_initial(
                ExchangeMessage::new(
                    PROTOCOL_SECURE_CHANNEL,
                    msg_type::SIGMA1,
                    sigma1_bytes.clone(),
                ),
                self.retransmission,
            )
            .await?;
        let response = messenger.process_message(response, None)?;

        match response.message_type {
            msg_type::SIGMA2_RESUME => {
                let record = record.ok_or_else(|| {
                    Error::UnexpectedData("Sigma2Resume without a resumption attempt".into())
                })?;
                self.handle_sigma2_resume(
                    messenger,
                    fabric,
                    peer_node_id,
                    initiator_session_id,
                    &initiator_random,
                    record,
                    &response.payload,
                )
                .await
            }
            msg_type::SIGMA2 => {
                self.handle_sigma2(
                    messenger,
                    fabric,
                    peer_node_id,
                    initiator_session_id,
                    &initiator_random,
                    ephemeral,
                    &ephemeral_public,
                    ipk,
                    &sigma1_bytes,
                    &response.payload,
                )
                .await
            }
            other => Err(Error::MatterFlow(format!(
                "expected Sigma2 or Sigma2Resume, got message type {other:#04x}"
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_sigma2_resume(
        &self,
        messenger: &mut SecureChannelMessenger,
        fabric: &Fabric,
        peer_node_id: NodeId,
        initiator_session_id: SessionId,
        initiator_random: &[u8; 32],
        record: ResumptionRecord,
        payload: &[u8],
    ) -> Result<Arc<SecureSession>> {
        let resume = Sigma2Resume::from_tlv(payload)?;

        let key = resume_key(
            &record.shared_secret,
            initiator_random,
            &resume.resumption_id,
            SIGMA2_RESUME_INFO,
        )?;
        crypto::aes128_ccm_decrypt(&key, NONCE_RESUME_2, &[], &resume.resume_mic)
            .map_err(|_| Error::UnexpectedData("Sigma2Resume MIC does not verify".into()))?;

        let salt = resume_session_salt(initiator_random, &resume.resumption_id);
        let session = self.sessions.install_session(
            initiator_session_id,
            SessionId(resume.responder_session_id),
            fabric.fabric_index,
            peer_node_id,
            &record.shared_secret,
            &salt,
            true,
            true,
            record.session_parameters,
            record.case_authenticated_tags.clone(),
        )?;

        self.sessions.save_resumption_record(ResumptionRecord {
            resumption_id: resume.resumption_id,
            ..record
        })?;

        messenger.send_success().await?;
        info!(peer = %peer_node_id, "CASE session resumed");
        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_sigma2(
        &self,
        messenger: &mut SecureChannelMessenger,
        fabric: &Fabric,
        peer_node_id: NodeId,
        initiator_session_id: SessionId,
        initiator_random: &[u8; 32],
        ephemeral: EphemeralKeyExchange,
        ephemeral_public: &[u8],
        ipk: &[u8; 16],
        sigma1_bytes: &[u8],
        sigma2_bytes: &[u8],
    ) -> Result<Arc<SecureSession>> {
        let sigma2 = Sigma2::from_tlv(sigma2_bytes)?;
        let shared_secret = ephemeral
            .exchange(&sigma2.responder_ephemeral_key)
            .map_err(Error::Crypto)?;

        // Decrypt and authenticate the responder's credentials.
        let mut salt_middle = sigma2.responder_random.to_vec();
        salt_middle.extend_from_slice(&sigma2.responder_ephemeral_key);
        let sigma2_salt = sigma_salt(ipk, &salt_middle, &transcript_hash(&[sigma1_bytes]));
        let sigma2_key = derive_key_16(&sigma2_salt, &shared_secret, SIGMA2_INFO)?;
        let tbe2 = decode_tbe(
            &crypto::aes128_ccm_decrypt(&sigma2_key, NONCE_SIGMA2, &[], &sigma2.encrypted2)
                .map_err(Error::Crypto)?,
        )?;
        let resumption_id = tbe2
            .resumption_id
            .ok_or_else(|| Error::UnexpectedData("Sigma2 lacks a resumption id".into()))?;

        let credentials = fabric.verify_credentials(&tbe2.noc, tbe2.icac.as_deref())?;
        if credentials.node_id != peer_node_id {
            return Err(Error::UnexpectedData(format!(
                "responder NOC names node {}, expected {}",
                credentials.node_id, peer_node_id
            )));
        }
        let tbs2 = tbs_bytes(
            &tbe2.noc,
            tbe2.icac.as_deref(),
            &sigma2.responder_ephemeral_key,
            ephemeral_public,
        );
        KeyPair::verify(&credentials.public_key, &tbs2, &tbe2.signature)
            .map_err(|_| Error::UnexpectedData("Sigma2 signature does not verify".into()))?;

        // Sign and encrypt our own credentials for Sigma3.
        let tbs3 = tbs_bytes(
            fabric.operational_cert(),
            fabric.intermediate_ca_cert(),
            ephemeral_public,
            &sigma2.responder_ephemeral_key,
        );
        let signature = fabric.sign(&tbs3);
        let tbe3 = tbe_bytes(
            fabric.operational_cert(),
            fabric.intermediate_ca_cert(),
            &signature,
            None,
        );
        let sigma3_salt = sigma_salt(
            ipk,
            &[],
            &transcript_hash(&[sigma1_bytes, sigma2_bytes]),
        );
        let sigma3_key = derive_key_16(&sigma3_salt, &shared_secret, SIGMA3_INFO)?;
        let encrypted3 = crypto::aes128_ccm_encrypt(&sigma3_key, NONCE_SIGMA3, &[], &tbe3)
            .map_err(Error::Crypto)?;

        let sigma3 =
            TlvElement::structure(Tag::Anonymous, vec![TlvElement::bytes(Tag::Context(1), encrypted3)]);
        let sigma3_bytes = sigma3.encode();
        messenger
            .send(
                msg_type::SIGMA3,
                sigma3_bytes.clone(),
                HEAVY_CRYPTO_PROCESSING_TIME,
            )
            .await?;
        messenger.wait_for_success().await?;

        let session_salt = sigma_salt(
            ipk,
            &[],
            &transcript_hash(&[sigma1_bytes, sigma2_bytes, &sigma3_bytes]),
        );
        let peer_params = sigma2.responder_session_params.unwrap_or_default();
        let session = self.sessions.install_session(
            initiator_session_id,
            SessionId(sigma2.responder_session_id),
            fabric.fabric_index,
            peer_node_id,
            &shared_secret,
            &session_salt,
            true,
            false,
            peer_params,
            credentials.case_authenticated_tags.clone(),
        )?;

        self.sessions.save_resumption_record(ResumptionRecord {
            fabric_index: fabric.fabric_index.0,
            peer_node_id: peer_node_id.0,
            shared_secret,
            resumption_id,
            session_parameters: peer_params,
            case_authenticated_tags: credentials.case_authenticated_tags,
        })?;

        info!(peer = %peer_node_id, "CASE session established");
        Ok(session)
    }
}

// =============================================================================
// RESPONDER
// =============================================================================

/// CASE responder.
pub struct CaseServer {
    sessions: Arc<SessionManager>,
}

impl CaseServer {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Serve one CASE exchange: read Sigma1, answer with Sigma2 or
    /// Sigma2Resume, and install the session. Failure semantics mirror the
    /// initiator's.
    pub async fn respond(
        &self,
        messenger: &mut SecureChannelMessenger,
        fabric: &Fabric,
    ) -> Result<Arc<SecureSession>> {
        match self.run(messenger, fabric).await {
            Ok(session) => Ok(session),
            Err(err) => {
                if !err.suppresses_status_report() {
                    let _ = messenger.send_error(protocol_status::INVALID_PARAM).await;
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        messenger: &mut SecureChannelMessenger,
        fabric: &Fabric,
    ) -> Result<Arc<SecureSession>> {
        let message = messenger.next_message(Some(msg_type::SIGMA1)).await?;
        let sigma1_bytes = message.payload;
        let sigma1 = Sigma1::from_tlv(&sigma1_bytes)?;

        let expected =
            fabric.destination_id(&sigma1.initiator_random, fabric.node_id)?;
        if expected != sigma1.destination_id {
            return Err(Error::UnexpectedData(
                "destination id does not match this fabric".into(),
            ));
        }

        // A valid resumption attempt takes the shortcut; an invalid MIC
        // falls back to the full handshake.
        if let (Some(resumption_id), Some(mic)) =
            (&sigma1.resumption_id, &sigma1.initiator_resume_mic)
        {
            if let Some(record) = self.sessions.find_resumption_record_by_id(resumption_id) {
                let key = resume_key(
                    &record.shared_secret,
                    &sigma1.initiator_random,
                    resumption_id,
                    SIGMA1_RESUME_INFO,
                )?;
                if crypto::aes128_ccm_decrypt(&key, NONCE_RESUME_1, &[], mic).is_ok() {
                    return self.resume(messenger, fabric, &sigma1, record).await;
                }
                debug!("resumption MIC invalid, continuing with full handshake");
            }
        }

        self.full_handshake(messenger, fabric, &sigma1, &sigma1_bytes)
            .await
    }

    async fn resume(
        &self,
        messenger: &mut SecureChannelMessenger,
        fabric: &Fabric,
        sigma1: &Sigma1,
        record: ResumptionRecord,
    ) -> Result<Arc<SecureSession>> {
        let new_resumption_id = crypto::random_bytes::<16>();
        let key = resume_key(
            &record.shared_secret,
            &sigma1.initiator_random,
            &new_resumption_id,
            SIGMA2_RESUME_INFO,
        )?;
        let mic =
            crypto::aes128_ccm_encrypt(&key, NONCE_RESUME_2, &[], &[]).map_err(Error::Crypto)?;

        let responder_session_id = self.sessions.allocate_session_id();
        let resume = Sigma2Resume {
            resumption_id: new_resumption_id,
            resume_mic: mic,
            responder_session_id: responder_session_id.0,
        };
        messenger
            .send_tlv(
                msg_type::SIGMA2_RESUME,
                &resume.to_tlv(),
                DEFAULT_EXPECTED_PROCESSING_TIME,
            )
            .await?;
        messenger.wait_for_success().await?;

        let salt = resume_session_salt(&sigma1.initiator_random, &new_resumption_id);
        let session = self.sessions.install_session(
            responder_session_id,
            SessionId(sigma1.initiator_session_id),
            fabric.fabric_index,
            NodeId(record.peer_node_id),
            &record.shared_secret,
            &salt,
            false,
            true,
            sigma1
                .initiator_session_params
                .unwrap_or(record.session_parameters),
            record.case_authenticated_tags.clone(),
        )?;

        self.sessions.save_resumption_record(ResumptionRecord {
            resumption_id: new_resumption_id,
            ..record
        })?;

        info!(peer = session.peer_node_id.0, "CASE session resumed (responder)");
        Ok(session)
    }

    async fn full_handshake(
        &self,
        messenger: &mut SecureChannelMessenger,
        fabric: &Fabric,
        sigma1: &Sigma1,
        sigma1_bytes: &[u8],
    ) -> Result<Arc<SecureSession>> {
        let ipk = fabric.operational_identity_protection_key();
        let responder_random = crypto::random_bytes::<32>();
        let responder_session_id = self.sessions.allocate_session_id();
        let resumption_id = crypto::random_bytes::<16>();
        let ephemeral = EphemeralKeyExchange::new();
        let ephemeral_public = ephemeral.public_key();
        let shared_secret = ephemeral
            .exchange(&sigma1.initiator_ephemeral_key)
            .map_err(Error::Crypto)?;

        // Sign our credentials and wrap them for Sigma2.
        let tbs2 = tbs_bytes(
            fabric.operational_cert(),
            fabric.intermediate_ca_cert(),
            &ephemeral_public,
            &sigma1.initiator_ephemeral_key,
        );
        let signature = fabric.sign(&tbs2);
        let tbe2 = tbe_bytes(
            fabric.operational_cert(),
            fabric.intermediate_ca_cert(),
            &signature,
            Some(&resumption_id),
        );
        let mut salt_middle = responder_random.to_vec();
        salt_middle.extend_from_slice(&ephemeral_public);
        let sigma2_salt = sigma_salt(ipk, &salt_middle, &transcript_hash(&[sigma1_bytes]));
        let sigma2_key = derive_key_16(&sigma2_salt, &shared_secret, SIGMA2_INFO)?;
        let encrypted2 = crypto::aes128_ccm_encrypt(&sigma2_key, NONCE_SIGMA2, &[], &tbe2)
            .map_err(Error::Crypto)?;

        let sigma2 = Sigma2 {
            responder_random,
            responder_session_id: responder_session_id.0,
            responder_ephemeral_key: ephemeral_public.to_vec(),
            encrypted2,
            responder_session_params: Some(SessionParameters::default()),
        };
        let sigma2_bytes = sigma2.to_tlv().encode();
        messenger
            .send(
                msg_type::SIGMA2,
                sigma2_bytes.clone(),
                HEAVY_CRYPTO_PROCESSING_TIME,
            )
            .await?;

        // Sigma3: the initiator's turn to authenticate.
        let sigma3_message = messenger.next_message(Some(msg_type::SIGMA3)).await?;
        let sigma3_bytes = sigma3_message.payload;
        let sigma3_root = TlvElement::decode(&sigma3_bytes)?;
        let encrypted3 = sigma3_root.expect_field(1)?.as_bytes()?;

        let sigma3_salt = sigma_salt(
            ipk,
            &[],
            &transcript_hash(&[sigma1_bytes, &sigma2_bytes]),
        );
        let sigma3_key = derive_key_16(&sigma3_salt, &shared_secret, SIGMA3_INFO)?;
        let tbe3 = decode_tbe(
            &crypto::aes128_ccm_decrypt(&sigma3_key, NONCE_SIGMA3, &[], encrypted3)
                .map_err(Error::Crypto)?,
        )?;

        let credentials = fabric.verify_credentials(&tbe3.noc, tbe3.icac.as_deref())?;
        let tbs3 = tbs_bytes(
            &tbe3.noc,
            tbe3.icac.as_deref(),
            &sigma1.initiator_ephemeral_key,
            &ephemeral_public,
        );
        KeyPair::verify(&credentials.public_key, &tbs3, &tbe3.signature)
            .map_err(|_| Error::UnexpectedData("Sigma3 signature does not verify".into()))?;

        messenger.send_success().await?;

        let session_salt = sigma_salt(
            ipk,
            &[],
            &transcript_hash(&[sigma1_bytes, &sigma2_bytes, &sigma3_bytes]),
        );
        let peer_params = sigma1.initiator_session_params.unwrap_or_default();
        let session = self.sessions.install_session(
            responder_session_id,
            SessionId(sigma1.initiator_session_id),
            fabric.fabric_index,
            credentials.node_id,
            &shared_secret,
            &session_salt,
            false,
            false,
            peer_params,
            credentials.case_authenticated_tags.clone(),
        )?;

        self.sessions.save_resumption_record(ResumptionRecord {
            fabric_index: fabric.fabric_index.0,
            peer_node_id: credentials.node_id.0,
            shared_secret,
            resumption_id,
            session_parameters: peer_params,
            case_authenticated_tags: credentials.case_authenticated_tags,
        })?;

        info!(peer = %credentials.node_id, "CASE session established (responder)");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AbortSignal, MessageChannel, MessageExchange};
    use crate::session::STORAGE_CONTEXT;
    use weft_cert::ca::{CertificateAuthority, STORAGE_CONTEXT as CA_CONTEXT};
    use weft_core::storage::{MemoryStorage, StorageContext};
    use weft_core::types::{FabricId, FabricIndex, NodeId, VendorId};

    const IPK: [u8; 16] = [0x42; 16];

    fn make_manager() -> Arc<SessionManager> {
        let storage = StorageContext::new(Arc::new(MemoryStorage::new()), STORAGE_CONTEXT);
        Arc::new(SessionManager::new(storage).unwrap())
    }

    fn make_pair() -> (Arc<Fabric>, Arc<Fabric>) {
        let storage = StorageContext::new(Arc::new(MemoryStorage::new()), CA_CONTEXT);
        let ca = CertificateAuthority::load_or_create(storage, Some(false)).unwrap();
        let fabric_id = FabricId(0x2906_C908_D115_D362);

        let make = |node_id: NodeId| {
            let key_pair = crypto::KeyPair::generate();
            let noc = ca
                .generate_noc(&key_pair.public_key(), fabric_id, node_id, &[])
                .unwrap();
            Arc::new(
                Fabric::new(
                    FabricIndex(1),
                    fabric_id,
                    node_id,
                    NodeId(0),
                    VendorId(0xFFF1),
                    "test",
                    key_pair,
                    ca.root_cert_bytes().to_vec(),
                    None,
                    noc.signed_tlv().unwrap(),
                    IPK,
                )
                .unwrap(),
            )
        };
        (make(NodeId(1)), make(NodeId(2)))
    }

    fn messengers() -> (SecureChannelMessenger, SecureChannelMessenger) {
        let (a, b) = MessageChannel::loopback();
        (
            SecureChannelMessenger::new(MessageExchange::new(a, 1, AbortSignal::new())),
            SecureChannelMessenger::new(MessageExchange::new(b, 1, AbortSignal::new())),
        )
    }

    async fn run_handshake(
        controller: Arc<Fabric>,
        device: Arc<Fabric>,
        controller_sessions: Arc<SessionManager>,
        device_sessions: Arc<SessionManager>,
    ) -> (Arc<SecureSession>, Arc<SecureSession>) {
        let (mut client_messenger, mut server_messenger) = messengers();

        let server = tokio::spawn(async move {
            CaseServer::new(device_sessions)
                .respond(&mut server_messenger, &device)
                .await
        });

        let client_session = CaseClient::new(controller_sessions)
            .establish(&mut client_messenger, &controller, NodeId(2))
            .await
            .unwrap();
        let server_session = server.await.unwrap().unwrap();
        (client_session, server_session)
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let (controller, device) = make_pair();
        let controller_sessions = make_manager();
        let device_sessions = make_manager();

        let (client, server) = run_handshake(
            controller.clone(),
            device,
            controller_sessions.clone(),
            device_sessions.clone(),
        )
        .await;

        // Mirrored key material on both ends.
        assert_eq!(client.keys.encrypt_key, server.keys.decrypt_key);
        assert_eq!(client.keys.decrypt_key, server.keys.encrypt_key);
        assert_eq!(
            client.keys.attestation_challenge,
            server.keys.attestation_challenge
        );
        assert!(!client.is_resumption);
        assert!(client.is_initiator);
        assert!(!server.is_initiator);
        assert_eq!(client.peer_node_id, NodeId(2));
        assert_eq!(server.peer_node_id, NodeId(1));
        assert_eq!(client.peer_session_id, server.id);
        assert_eq!(server.peer_session_id, client.id);

        // Both sides persisted matching resumption records.
        let client_record = controller_sessions
            .find_resumption_record(FabricIndex(1), NodeId(2))
            .unwrap();
        let server_record = device_sessions
            .find_resumption_record(FabricIndex(1), NodeId(1))
            .unwrap();
        assert_eq!(client_record.resumption_id, server_record.resumption_id);
        assert_eq!(client_record.shared_secret, server_record.shared_secret);
    }

    #[tokio::test]
    async fn test_resumption_shortcut() {
        let (controller, device) = make_pair();
        let controller_sessions = make_manager();
        let device_sessions = make_manager();

        let (first_client, _) = run_handshake(
            controller.clone(),
            device.clone(),
            controller_sessions.clone(),
            device_sessions.clone(),
        )
        .await;

        let (second_client, second_server) = run_handshake(
            controller,
            device,
            controller_sessions.clone(),
            device_sessions.clone(),
        )
        .await;

        assert!(second_client.is_resumption);
        assert!(second_server.is_resumption);
        assert_eq!(second_client.keys.encrypt_key, second_server.keys.decrypt_key);
        // Fresh keys despite the shared secret being reused.
        assert_ne!(second_client.keys.encrypt_key, first_client.keys.encrypt_key);

        // The record rotated to a fresh resumption id on both ends.
        let client_record = controller_sessions
            .find_resumption_record(FabricIndex(1), NodeId(2))
            .unwrap();
        let server_record = device_sessions
            .find_resumption_record(FabricIndex(1), NodeId(1))
            .unwrap();
        assert_eq!(client_record.resumption_id, server_record.resumption_id);
    }

    #[tokio::test]
    async fn test_wrong_peer_node_id_fails() {
        let (controller, device) = make_pair();
        let controller_sessions = make_manager();
        let device_sessions = make_manager();

        let (mut client_messenger, mut server_messenger) = messengers();
        let server = tokio::spawn(async move {
            CaseServer::new(device_sessions)
                .respond(&mut server_messenger, &device)
                .await
        });

        // Destination id names node 7, which the device is not.
        let err = CaseClient::new(controller_sessions)
            .establish(&mut client_messenger, &controller, NodeId(7))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelStatusResponse { .. }));

        // The server rejected the destination id and reported InvalidParam.
        let server_err = server.await.unwrap().unwrap_err();
        assert!(matches!(server_err, Error::UnexpectedData(_)));
    }

    #[tokio::test]
    async fn test_foreign_ipk_fails_decryption() {
        let (controller, device) = make_pair();
        let controller_sessions = make_manager();
        let device_sessions = make_manager();

        // Rebuild the device fabric with a different IPK over the same CA
        // material by reusing its certificates.
        let device_bad = Arc::new(
            Fabric::new(
                FabricIndex(1),
                device.fabric_id,
                device.node_id,
                NodeId(0),
                VendorId(0xFFF1),
                "test",
                crypto::KeyPair::generate(),
                device.root_cert().to_vec(),
                None,
                device.operational_cert().to_vec(),
                [0x99; 16],
            )
            .unwrap(),
        );

        let (mut client_messenger, mut server_messenger) = messengers();
        let server = tokio::spawn(async move {
            CaseServer::new(device_sessions)
                .respond(&mut server_messenger, &device_bad)
                .await
        });

        let err = CaseClient::new(controller_sessions)
            .establish(&mut client_messenger, &controller, NodeId(2))
            .await
            .unwrap_err();
        // The responder computes a different destination id and declines.
        assert!(matches!(err, Error::ChannelStatusResponse { .. }));
        assert!(server.await.unwrap().is_err());
    }
}
