use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::AdmissionError;
use crate::ports::PortList;
use crate::protocol::Protocol;

/// 公開ポートの占有管理
///
/// 確認と登録を一つのロック内で行うため、同じポートを要求する二つの
/// セッションが同時に受け入れられることはない。ロック中にI/Oはしない。
#[derive(Debug, Default)]
pub struct PortClaims {
    claimed: Mutex<HashMap<(Protocol, u16), u64>>,
}

impl PortClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// セッションにポートを割り当てる。一つでも使用中なら何も登録しない
    pub fn claim(&self, session_id: u64, tcp: &PortList, udp: &PortList) -> Result<(), AdmissionError> {
        let mut claimed = self.lock();

        // TCPの衝突を先に報告する
        for (protocol, ports) in [(Protocol::Tcp, tcp), (Protocol::Udp, udp)] {
            let busy: Vec<u16> = ports
                .iter()
                .filter(|port| claimed.contains_key(&(protocol, *port)))
                .collect();
            if !busy.is_empty() {
                return Err(AdmissionError::PortsAlreadyInUse {
                    protocol,
                    ports: busy,
                });
            }
        }

        for port in tcp.iter() {
            claimed.insert((Protocol::Tcp, port), session_id);
        }
        for port in udp.iter() {
            claimed.insert((Protocol::Udp, port), session_id);
        }
        Ok(())
    }

    /// セッションの持つポートをすべて解放
    pub fn release(&self, session_id: u64) -> usize {
        let mut claimed = self.lock();
        let before = claimed.len();
        claimed.retain(|_, owner| *owner != session_id);
        before - claimed.len()
    }

    pub fn claimed_by(&self, protocol: Protocol, port: u16) -> Option<u64> {
        self.lock().get(&(protocol, port)).copied()
    }

    /// 割り当て済みポート数
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(Protocol, u16), u64>> {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner())
    }
}
