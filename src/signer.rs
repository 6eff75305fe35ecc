use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng; // 用于生成私钥的安全随机数生成器
use sha2::{Digest, Sha256};

use crate::error::CustodyError;
use crate::evidence::{AnonymousIdentity, IdentityProof};

/// 匿名身份模块
///
/// 提交者只以公钥指纹出现在系统里：指纹 = SHA-256(公钥字节) 的 hex。
/// 没有人知道是谁持有对应的私钥，信誉与通知都按指纹路由。
pub fn fingerprint(public_key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 提交端密钥 (在实际部署中只存在于提交者本地)
pub struct SubmitterKey {
    keypair: SigningKey,
}

impl SubmitterKey {
    pub fn generate() -> Self {
        let keypair = SigningKey::generate(&mut OsRng);
        Self { keypair }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.keypair.verifying_key()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }

    /// 对内容哈希做分离签名
    pub fn sign_content_hash(&self, content_hash: &str) -> Signature {
        self.keypair.sign(content_hash.as_bytes())
    }

    /// 生成可随证据一起提交的完整身份证明 (含公钥)
    pub fn prove(&self, content_hash: &str) -> IdentityProof {
        IdentityProof {
            fingerprint: self.fingerprint(),
            signature: hex::encode(self.sign_content_hash(content_hash).to_bytes()),
            public_key: Some(hex::encode(self.public_key().to_bytes())),
        }
    }
}

/// 校验身份证明并转换成记录上的匿名身份字段
///
/// 指纹与签名必须非空；若附带公钥，还要求指纹与公钥一致、签名能验过内容哈希。
pub fn check_proof(
    proof: &IdentityProof,
    content_hash: &str,
) -> Result<AnonymousIdentity, CustodyError> {
    if proof.fingerprint.trim().is_empty() {
        return Err(CustodyError::validation(
            "public key fingerprint is required for anonymous identity",
        ));
    }
    if proof.signature.trim().is_empty() {
        return Err(CustodyError::validation(
            "signature is required to prove ownership of keypair",
        ));
    }

    if let Some(public_key) = proof.public_key.as_deref() {
        let key = decode_public_key(public_key)?;
        if !fingerprint(&key).eq_ignore_ascii_case(&proof.fingerprint) {
            return Err(CustodyError::validation(
                "fingerprint does not match the presented public key",
            ));
        }
        let signature = decode_signature(&proof.signature)?;
        key.verify(content_hash.as_bytes(), &signature)
            .map_err(|_| CustodyError::validation("signature does not verify over content hash"))?;
    }

    Ok(AnonymousIdentity {
        fingerprint: proof.fingerprint.clone(),
        signature: proof.signature.clone(),
    })
}

fn decode_public_key(value: &str) -> Result<VerifyingKey, CustodyError> {
    let bytes: [u8; 32] = hex::decode(value)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CustodyError::validation("public key must be 32 hex-encoded bytes"))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| CustodyError::validation("public key is not a valid ed25519 point"))
}

fn decode_signature(value: &str) -> Result<Signature, CustodyError> {
    let bytes: [u8; 64] = hex::decode(value)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CustodyError::validation("signature must be 64 hex-encoded bytes"))?;
    Ok(Signature::from_bytes(&bytes))
}
