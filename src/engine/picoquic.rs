//! picoquic backend.
//!
//! Binds the C engine plus the small slipstream helper library (poll
//! frames, per-path modes, stateless packet lookup). All unsafe code of the
//! crate lives in this file. Engine callbacks never touch the session: the
//! trampoline only records `EngineEvent`s in a registry that the session
//! drains through `poll_event`.

#![allow(non_camel_case_types)]

use super::{
    CloseReason, ConnHandle, EngineError, EngineEvent, Incoming, PathHandle, PathQuality,
    PreparedPacket, QuicEngine, Result, StatelessPacket, StreamId, RESET_SECRET_LEN,
};
use crate::congestion::{CongestionAlgorithm, PathCongestion};
use crate::dns::normalize_dual_stack_addr;
use crate::pinning::{CertPin, CertVerification, SUPPORTED_SCHEMES};
use crate::stateless::parse_header;
use libc::{c_char, c_int, c_uint, c_void, size_t, sockaddr, sockaddr_storage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CString;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;

const CONNECTION_ID_MAX_SIZE: usize = 20;
const MAX_PACKET_SIZE: usize = 1536;
const QUIC_V1: c_uint = 1;
/// `picoquic_get_path_addr` selector for the peer address
const PATH_ADDR_PEER: c_int = 2;
/// Reset tokens remembered for unknown connection ids
const RESET_TOKEN_CACHE_MAX: usize = 256;
const SIG_ALGO_SENTINEL: u16 = 0xFFFF;

static PINNED_ALGOS: [u16; SUPPORTED_SCHEMES.len() + 1] = {
    let mut algos = [SIG_ALGO_SENTINEL; SUPPORTED_SCHEMES.len() + 1];
    let mut i = 0;
    while i < SUPPORTED_SCHEMES.len() {
        algos[i] = SUPPORTED_SCHEMES[i];
        i += 1;
    }
    algos
};

#[repr(C)]
#[derive(Clone, Copy)]
struct picoquic_connection_id_t {
    id: [u8; CONNECTION_ID_MAX_SIZE],
    id_len: u8,
}

#[repr(C)]
struct picoquic_quic_t {
    _private: [u8; 0],
}

#[repr(C)]
struct picoquic_cnx_t {
    _private: [u8; 0],
}

#[repr(C)]
struct ptls_t {
    _private: [u8; 0],
}

#[repr(C)]
struct picoquic_congestion_algorithm_t {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct picoquic_path_quality_t {
    receive_rate_estimate: u64,
    pacing_rate: u64,
    cwin: u64,
    rtt: u64,
    rtt_sample: u64,
    rtt_variant: u64,
    rtt_min: u64,
    rtt_max: u64,
    sent: u64,
    lost: u64,
    timer_losses: u64,
    spurious_losses: u64,
    max_spurious_rtt: u64,
    max_reorder_delay: u64,
    max_reorder_gap: u64,
    bytes_in_transit: u64,
}

impl From<picoquic_path_quality_t> for PathQuality {
    fn from(q: picoquic_path_quality_t) -> Self {
        PathQuality {
            pacing_rate: q.pacing_rate,
            cwin: q.cwin,
            rtt: q.rtt,
            bytes_in_transit: q.bytes_in_transit,
            sent: q.sent,
            lost: q.lost,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ptls_iovec_t {
    base: *mut u8,
    len: size_t,
}

// Callback event codes
const CB_STREAM_DATA: c_int = 0;
const CB_STREAM_FIN: c_int = 1;
const CB_STREAM_RESET: c_int = 2;
const CB_STOP_SENDING: c_int = 3;
const CB_STATELESS_RESET: c_int = 4;
const CB_CLOSE: c_int = 5;
const CB_APPLICATION_CLOSE: c_int = 6;
const CB_ALMOST_READY: c_int = 9;
const CB_READY: c_int = 10;
const CB_PATH_AVAILABLE: c_int = 20;
const CB_PATH_DELETED: c_int = 22;

type stream_data_cb_fn = Option<
    unsafe extern "C" fn(
        cnx: *mut picoquic_cnx_t,
        stream_id: u64,
        bytes: *mut u8,
        length: size_t,
        fin_or_event: c_int,
        callback_ctx: *mut c_void,
        stream_ctx: *mut c_void,
    ) -> c_int,
>;

type connection_id_cb_fn = Option<
    unsafe extern "C" fn(
        quic: *mut picoquic_quic_t,
        cnx_id_local: picoquic_connection_id_t,
        cnx_id_remote: picoquic_connection_id_t,
        cnx_id_cb_data: *mut c_void,
        cnx_id_returned: *mut picoquic_connection_id_t,
    ),
>;

type verify_sign_cb_fn = Option<
    unsafe extern "C" fn(
        verify_ctx: *mut c_void,
        algo: u16,
        data: ptls_iovec_t,
        sign: ptls_iovec_t,
    ) -> c_int,
>;

#[repr(C)]
struct ptls_verify_certificate_t {
    cb: Option<
        unsafe extern "C" fn(
            self_ptr: *mut ptls_verify_certificate_t,
            tls: *mut ptls_t,
            server_name: *const c_char,
            verify_sign: *mut verify_sign_cb_fn,
            verify_sign_ctx: *mut *mut c_void,
            certs: *mut ptls_iovec_t,
            num_certs: size_t,
        ) -> c_int,
    >,
    algos: *const u16,
}

extern "C" {
    fn picoquic_current_time() -> u64;
    fn picoquic_create(
        max_nb_connections: c_uint,
        cert_file_name: *const c_char,
        key_file_name: *const c_char,
        cert_root_file_name: *const c_char,
        default_alpn: *const c_char,
        default_callback_fn: stream_data_cb_fn,
        default_callback_ctx: *mut c_void,
        cnx_id_callback: connection_id_cb_fn,
        cnx_id_callback_data: *mut c_void,
        reset_seed: *const u8,
        current_time: u64,
        p_simulated_time: *mut u64,
        ticket_file_name: *const c_char,
        ticket_encryption_key: *const u8,
        ticket_encryption_key_length: size_t,
    ) -> *mut picoquic_quic_t;
    fn picoquic_free(quic: *mut picoquic_quic_t);

    fn picoquic_set_cookie_mode(quic: *mut picoquic_quic_t, cookie_mode: c_int);
    fn picoquic_set_default_priority(quic: *mut picoquic_quic_t, default_stream_priority: u8);
    fn picoquic_set_stream_data_consumption_mode(quic: *mut picoquic_quic_t, defer: c_int);
    fn picoquic_set_default_congestion_algorithm(
        quic: *mut picoquic_quic_t,
        alg: *mut picoquic_congestion_algorithm_t,
    );
    fn picoquic_set_default_multipath_option(quic: *mut picoquic_quic_t, option: c_int);
    fn picoquic_set_preemptive_repeat_policy(quic: *mut picoquic_quic_t, do_repeat: c_int);
    fn picoquic_disable_port_blocking(quic: *mut picoquic_quic_t, disabled: c_int);
    fn picoquic_set_max_data_control(quic: *mut picoquic_quic_t, max_data: u64);
    fn picoquic_set_mtu_max(quic: *mut picoquic_quic_t, mtu_max: u32);
    fn picoquic_set_initial_send_mtu(quic: *mut picoquic_quic_t, ipv4: u32, ipv6: u32);
    fn picoquic_set_key_log_file_from_env(quic: *mut picoquic_quic_t);
    fn picoquic_enable_path_callbacks_default(quic: *mut picoquic_quic_t, enabled: c_int);
    fn picoquic_set_null_verifier(quic: *mut picoquic_quic_t);
    fn picoquic_set_verify_certificate_callback(
        quic: *mut picoquic_quic_t,
        cb: *mut ptls_verify_certificate_t,
        free_fn: Option<unsafe extern "C" fn(*mut ptls_verify_certificate_t)>,
    );

    static mut slipstream_server_cc_algorithm: *mut picoquic_congestion_algorithm_t;
    static mut slipstream_mixed_cc_algorithm: *mut picoquic_congestion_algorithm_t;
    fn slipstream_set_cc_override(alg_name: *const c_char);
    fn slipstream_take_stateless_packet_for_cid(
        quic: *mut picoquic_quic_t,
        packet: *const u8,
        packet_len: size_t,
        out_bytes: *mut u8,
        out_capacity: size_t,
        out_len: *mut size_t,
    ) -> c_int;

    fn picoquic_create_client_cnx(
        quic: *mut picoquic_quic_t,
        addr: *mut sockaddr,
        start_time: u64,
        preferred_version: c_uint,
        sni: *const c_char,
        alpn: *const c_char,
        callback_fn: stream_data_cb_fn,
        callback_ctx: *mut c_void,
    ) -> *mut picoquic_cnx_t;
    fn picoquic_start_client_cnx(cnx: *mut picoquic_cnx_t) -> c_int;
    fn picoquic_close(cnx: *mut picoquic_cnx_t, application_reason_code: u64) -> c_int;
    fn picoquic_close_immediate(cnx: *mut picoquic_cnx_t);
    fn picoquic_delete_cnx(cnx: *mut picoquic_cnx_t);
    fn picoquic_get_close_reasons(
        cnx: *mut picoquic_cnx_t,
        local_reason: *mut u64,
        remote_reason: *mut u64,
        local_application_reason: *mut u64,
        remote_application_reason: *mut u64,
    );

    fn picoquic_get_next_wake_delay(quic: *mut picoquic_quic_t, now: u64, delay_max: i64) -> i64;
    fn picoquic_get_default_path_quality(
        cnx: *mut picoquic_cnx_t,
        quality: *mut picoquic_path_quality_t,
    );
    fn picoquic_get_path_quality(
        cnx: *mut picoquic_cnx_t,
        unique_path_id: u64,
        quality: *mut picoquic_path_quality_t,
    ) -> c_int;
    fn picoquic_get_path_addr(
        cnx: *mut picoquic_cnx_t,
        unique_path_id: u64,
        local: c_int,
        addr: *mut sockaddr_storage,
    ) -> c_int;
    fn picoquic_probe_new_path_ex(
        cnx: *mut picoquic_cnx_t,
        addr_peer: *const sockaddr,
        addr_local: *const sockaddr,
        if_index: c_int,
        current_time: u64,
        to_preferred_address: c_int,
        path_id_p: *mut c_int,
    ) -> c_int;

    fn slipstream_request_poll(cnx: *mut picoquic_cnx_t);
    fn slipstream_is_flow_blocked(cnx: *mut picoquic_cnx_t) -> c_int;
    fn slipstream_has_ready_stream(cnx: *mut picoquic_cnx_t) -> c_int;
    fn slipstream_find_path_id_by_addr(cnx: *mut picoquic_cnx_t, peer: *const sockaddr) -> c_int;
    fn slipstream_set_path_mode(cnx: *mut picoquic_cnx_t, path_id: c_int, mode: c_int);
    fn slipstream_set_path_ack_delay(cnx: *mut picoquic_cnx_t, path_id: c_int, disable: c_int);

    fn picoquic_prepare_packet_ex(
        cnx: *mut picoquic_cnx_t,
        path_id_request: c_int,
        current_time: u64,
        send_buffer: *mut u8,
        send_buffer_max: size_t,
        send_length: *mut size_t,
        p_addr_to: *mut sockaddr_storage,
        p_addr_from: *mut sockaddr_storage,
        if_index: *mut c_int,
        send_msg_size: *mut size_t,
    ) -> c_int;
    fn picoquic_incoming_packet_ex(
        quic: *mut picoquic_quic_t,
        bytes: *mut u8,
        packet_length: size_t,
        addr_from: *mut sockaddr,
        addr_to: *mut sockaddr,
        if_index_to: c_int,
        received_ecn: u8,
        first_cnx: *mut *mut picoquic_cnx_t,
        first_path_id: *mut c_int,
        current_time: u64,
    ) -> c_int;

    fn picoquic_add_to_stream(
        cnx: *mut picoquic_cnx_t,
        stream_id: u64,
        data: *const u8,
        length: size_t,
        set_fin: c_int,
    ) -> c_int;
    fn picoquic_reset_stream(cnx: *mut picoquic_cnx_t, stream_id: u64, error: u64) -> c_int;
    fn picoquic_stop_sending(cnx: *mut picoquic_cnx_t, stream_id: u64, error: u64) -> c_int;
    fn picoquic_stream_data_consumed(
        cnx: *mut picoquic_cnx_t,
        stream_id: u64,
        new_offset: u64,
    ) -> c_int;
}

fn socket_addr_to_storage(addr: SocketAddr) -> sockaddr_storage {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(addr) => {
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = addr.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
        }
        SocketAddr::V6(addr) => {
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in6.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = addr.port().to_be();
            sin6.sin6_flowinfo = addr.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: addr.ip().octets(),
            };
            sin6.sin6_scope_id = addr.scope_id();
        }
    }
    storage
}

fn storage_to_socket_addr(storage: &sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            // SAFETY: the family tag says this is a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: the family tag says this is a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| EngineError::InvalidArgument(format!("{} contains NUL", what)))
}

fn check(op: &'static str, code: c_int) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(EngineError::Rejected { op, code })
    }
}

#[derive(Debug, Clone, Copy)]
struct PathEntry {
    peer: SocketAddr,
    unique: Option<u64>,
}

/// State shared with the callback trampoline
///
/// Owned through a raw pointer by the engine; only touched from inside
/// engine calls, which all run on the session task.
#[derive(Default)]
struct Registry {
    cnx_by_handle: HashMap<ConnHandle, *mut picoquic_cnx_t>,
    handle_by_cnx: HashMap<usize, ConnHandle>,
    next_handle: u64,
    announced: HashSet<ConnHandle>,
    paths: HashMap<ConnHandle, Vec<PathEntry>>,
    events: VecDeque<EngineEvent>,
}

impl Registry {
    fn handle_for(&mut self, cnx: *mut picoquic_cnx_t) -> ConnHandle {
        if let Some(handle) = self.handle_by_cnx.get(&(cnx as usize)) {
            return *handle;
        }
        self.next_handle += 1;
        let handle = ConnHandle(self.next_handle);
        self.handle_by_cnx.insert(cnx as usize, handle);
        self.cnx_by_handle.insert(handle, cnx);
        handle
    }

    fn forget(&mut self, handle: ConnHandle) -> Option<*mut picoquic_cnx_t> {
        let cnx = self.cnx_by_handle.remove(&handle)?;
        self.handle_by_cnx.remove(&(cnx as usize));
        self.announced.remove(&handle);
        self.paths.remove(&handle);
        Some(cnx)
    }

    fn path_for(&mut self, cnx: ConnHandle, peer: SocketAddr, unique: Option<u64>) -> PathHandle {
        let peer = normalize_dual_stack_addr(peer);
        let entries = self.paths.entry(cnx).or_default();
        if let Some(index) = entries.iter().position(|e| e.peer == peer) {
            if unique.is_some() {
                entries[index].unique = unique;
            }
            return PathHandle(index as u64);
        }
        entries.push(PathEntry { peer, unique });
        PathHandle(entries.len() as u64 - 1)
    }

    fn path_entry(&self, cnx: ConnHandle, path: PathHandle) -> Option<PathEntry> {
        self.paths.get(&cnx)?.get(path.0 as usize).copied()
    }

    fn path_by_unique(&self, cnx: ConnHandle, unique: u64) -> Option<PathHandle> {
        let entries = self.paths.get(&cnx)?;
        entries
            .iter()
            .position(|e| e.unique == Some(unique))
            .map(|index| PathHandle(index as u64))
    }

    /// Record one engine callback; runs inside FFI calls
    fn on_callback(
        &mut self,
        cnx: *mut picoquic_cnx_t,
        stream: u64,
        data: &[u8],
        event: c_int,
    ) {
        match event {
            CB_STREAM_DATA | CB_STREAM_FIN => {
                let handle = self.handle_for(cnx);
                self.events.push_back(EngineEvent::StreamData {
                    cnx: handle,
                    stream,
                    data: data.to_vec(),
                    fin: event == CB_STREAM_FIN,
                });
            }
            CB_STREAM_RESET | CB_STOP_SENDING => {
                let handle = self.handle_for(cnx);
                // The peer's error code is not passed to the callback
                let code = super::APP_INTERNAL_ERROR;
                self.events.push_back(if event == CB_STREAM_RESET {
                    EngineEvent::StreamReset {
                        cnx: handle,
                        stream,
                        code,
                    }
                } else {
                    EngineEvent::StopSending {
                        cnx: handle,
                        stream,
                        code,
                    }
                });
            }
            CB_ALMOST_READY | CB_READY => {
                let handle = self.handle_for(cnx);
                if self.announced.insert(handle) {
                    self.events.push_back(EngineEvent::Ready { cnx: handle });
                }
            }
            CB_CLOSE | CB_APPLICATION_CLOSE | CB_STATELESS_RESET => {
                let Some(handle) = self.handle_by_cnx.get(&(cnx as usize)).copied() else {
                    return;
                };
                // SAFETY: cnx is valid for the duration of the callback.
                let reason = unsafe { close_reason(cnx, event) };
                self.forget(handle);
                self.events.push_back(EngineEvent::Closed {
                    cnx: handle,
                    reason,
                });
            }
            CB_PATH_AVAILABLE => {
                let handle = self.handle_for(cnx);
                let mut storage: sockaddr_storage =
                    // SAFETY: sockaddr_storage is plain old data.
                    unsafe { std::mem::zeroed() };
                // SAFETY: cnx is valid and storage is a writable out parameter.
                let ret = unsafe { picoquic_get_path_addr(cnx, stream, PATH_ADDR_PEER, &mut storage) };
                if ret != 0 {
                    return;
                }
                if let Some(peer) = storage_to_socket_addr(&storage) {
                    let path = self.path_for(handle, peer, Some(stream));
                    self.events.push_back(EngineEvent::PathAvailable {
                        cnx: handle,
                        path,
                        peer: normalize_dual_stack_addr(peer),
                    });
                }
            }
            CB_PATH_DELETED => {
                let handle = self.handle_for(cnx);
                if let Some(path) = self.path_by_unique(handle, stream) {
                    if let Some(entry) = self.paths.get_mut(&handle).and_then(|e| e.get_mut(path.0 as usize)) {
                        entry.unique = None;
                    }
                    self.events.push_back(EngineEvent::PathDeleted { cnx: handle, path });
                }
            }
            _ => {}
        }
    }
}

unsafe fn close_reason(cnx: *mut picoquic_cnx_t, event: c_int) -> CloseReason {
    let (mut local, mut remote, mut local_app, mut remote_app) = (0u64, 0u64, 0u64, 0u64);
    picoquic_get_close_reasons(cnx, &mut local, &mut remote, &mut local_app, &mut remote_app);
    match event {
        CB_APPLICATION_CLOSE => CloseReason {
            code: remote_app,
            application: true,
            remote: true,
        },
        CB_STATELESS_RESET => CloseReason {
            code: 0,
            application: false,
            remote: true,
        },
        _ if remote != 0 => CloseReason {
            code: remote,
            application: false,
            remote: true,
        },
        _ if local_app != 0 => CloseReason::local(local_app),
        _ => CloseReason {
            code: local,
            application: false,
            remote: false,
        },
    }
}

unsafe extern "C" fn stream_callback(
    cnx: *mut picoquic_cnx_t,
    stream_id: u64,
    bytes: *mut u8,
    length: size_t,
    fin_or_event: c_int,
    callback_ctx: *mut c_void,
    _stream_ctx: *mut c_void,
) -> c_int {
    if callback_ctx.is_null() || cnx.is_null() {
        return 0;
    }
    // SAFETY: callback_ctx is the registry installed at creation; it outlives the quic context.
    let registry = &mut *(callback_ctx as *mut Registry);
    let data = if bytes.is_null() || length == 0 {
        &[][..]
    } else {
        // SAFETY: picoquic hands out `length` readable bytes for the callback.
        std::slice::from_raw_parts(bytes as *const u8, length)
    };
    registry.on_callback(cnx, stream_id, data, fin_or_event);
    0
}

#[repr(C)]
struct PinnedVerifier {
    base: ptls_verify_certificate_t,
    pin: CertPin,
}

unsafe extern "C" fn pinned_verify_certificate(
    self_ptr: *mut ptls_verify_certificate_t,
    _tls: *mut ptls_t,
    _server_name: *const c_char,
    verify_sign: *mut verify_sign_cb_fn,
    verify_sign_ctx: *mut *mut c_void,
    certs: *mut ptls_iovec_t,
    num_certs: size_t,
) -> c_int {
    if self_ptr.is_null() || certs.is_null() || num_certs == 0 {
        return -1;
    }
    // SAFETY: self_ptr is the first field of a boxed PinnedVerifier.
    let verifier = &*(self_ptr as *const PinnedVerifier);
    let leaf = *certs;
    if leaf.base.is_null() || leaf.len == 0 {
        return -1;
    }
    // SAFETY: picotls keeps the chain alive for the duration of the callback.
    let leaf = std::slice::from_raw_parts(leaf.base as *const u8, leaf.len);
    if !verifier.pin.matches(leaf) {
        log::warn!(
            "Server certificate does not match pin {}",
            verifier.pin.fingerprint_hex()
        );
        return -1;
    }
    if !verify_sign.is_null() {
        *verify_sign = Some(pinned_verify_sign);
    }
    if !verify_sign_ctx.is_null() {
        *verify_sign_ctx = self_ptr as *mut c_void;
    }
    0
}

unsafe extern "C" fn pinned_verify_sign(
    verify_ctx: *mut c_void,
    algo: u16,
    data: ptls_iovec_t,
    sign: ptls_iovec_t,
) -> c_int {
    if verify_ctx.is_null() {
        return -1;
    }
    // Final call with empty buffers releases the context
    if data.base.is_null() && data.len == 0 && sign.base.is_null() && sign.len == 0 {
        return 0;
    }
    if data.base.is_null() || sign.base.is_null() {
        return -1;
    }
    let verifier = &*(verify_ctx as *const PinnedVerifier);
    // SAFETY: picotls supplies both buffers for the duration of the call.
    let message = std::slice::from_raw_parts(data.base as *const u8, data.len);
    let signature = std::slice::from_raw_parts(sign.base as *const u8, sign.len);
    if verifier.pin.verify_signature(algo, message, signature) {
        0
    } else {
        -1
    }
}

unsafe extern "C" fn pinned_verify_free(ctx: *mut ptls_verify_certificate_t) {
    if !ctx.is_null() {
        drop(Box::from_raw(ctx as *mut PinnedVerifier));
    }
}

/// Server-side settings for `PicoquicEngine::server`
#[derive(Debug, Clone)]
pub struct ServerIdentity<'a> {
    pub cert: &'a Path,
    pub key: &'a Path,
    pub alpn: &'a str,
    pub reset_seed: Option<[u8; RESET_SECRET_LEN]>,
    pub max_connections: usize,
    pub mtu: u32,
}

/// Client-side settings for `PicoquicEngine::client`
#[derive(Debug, Clone)]
pub struct ClientIdentity<'a> {
    pub alpn: &'a str,
    pub sni: &'a str,
    pub verification: CertVerification,
    pub congestion_override: Option<CongestionAlgorithm>,
    pub mtu: u32,
}

pub struct PicoquicEngine {
    quic: *mut picoquic_quic_t,
    registry: *mut Registry,
    alpn: CString,
    sni: CString,
    stateless: VecDeque<StatelessPacket>,
    reset_tokens: HashMap<Vec<u8>, [u8; RESET_SECRET_LEN]>,
}

// SAFETY: the engine is driven from one task at a time and picoquic keeps no
// thread-affine state; the raw pointers are owned exclusively by this value.
unsafe impl Send for PicoquicEngine {}

impl PicoquicEngine {
    pub fn client(identity: ClientIdentity<'_>) -> Result<Self> {
        let alpn = c_string(identity.alpn, "ALPN")?;
        let sni = c_string(identity.sni, "SNI")?;
        let override_name = identity
            .congestion_override
            .map(|alg| c_string(alg.name(), "congestion algorithm"))
            .transpose()?;

        let engine = Self::create(alpn, sni, None, 1, None)?;
        // SAFETY: quic was just created and is valid until drop.
        unsafe {
            engine.configure(identity.mtu);
            if let Some(name) = override_name.as_ref() {
                slipstream_set_cc_override(name.as_ptr());
            }
            picoquic_set_default_congestion_algorithm(engine.quic, slipstream_mixed_cc_algorithm);
            match identity.verification {
                CertVerification::Insecure => picoquic_set_null_verifier(engine.quic),
                CertVerification::Pinned(pin) => {
                    log::info!("Pinning server certificate {}", pin.fingerprint_hex());
                    let verifier = Box::into_raw(Box::new(PinnedVerifier {
                        base: ptls_verify_certificate_t {
                            cb: Some(pinned_verify_certificate),
                            algos: PINNED_ALGOS.as_ptr(),
                        },
                        pin,
                    }));
                    // picoquic owns the verifier from here and frees it through the callback
                    picoquic_set_verify_certificate_callback(
                        engine.quic,
                        &mut (*verifier).base,
                        Some(pinned_verify_free),
                    );
                }
            }
        }
        Ok(engine)
    }

    pub fn server(identity: ServerIdentity<'_>) -> Result<Self> {
        let alpn = c_string(identity.alpn, "ALPN")?;
        let cert = c_string(&identity.cert.to_string_lossy(), "certificate path")?;
        let key = c_string(&identity.key.to_string_lossy(), "key path")?;
        let max = c_uint::try_from(identity.max_connections).unwrap_or(c_uint::MAX);

        let engine = Self::create(
            alpn,
            CString::default(),
            Some((cert, key)),
            max,
            identity.reset_seed,
        )?;
        // SAFETY: quic was just created and is valid until drop.
        unsafe {
            engine.configure(identity.mtu);
            if slipstream_server_cc_algorithm.is_null() {
                return Err(EngineError::Setup(
                    "server congestion algorithm unavailable".to_string(),
                ));
            }
            picoquic_set_default_congestion_algorithm(engine.quic, slipstream_server_cc_algorithm);
        }
        Ok(engine)
    }

    fn create(
        alpn: CString,
        sni: CString,
        identity: Option<(CString, CString)>,
        max_connections: c_uint,
        reset_seed: Option<[u8; RESET_SECRET_LEN]>,
    ) -> Result<Self> {
        let registry = Box::into_raw(Box::<Registry>::default());
        let (cert_ptr, key_ptr) = identity
            .as_ref()
            .map(|(c, k)| (c.as_ptr(), k.as_ptr()))
            .unwrap_or((std::ptr::null(), std::ptr::null()));
        let seed_ptr = reset_seed
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(std::ptr::null());

        // SAFETY: every pointer is either null or valid for the call; picoquic copies
        // the strings and the seed before returning.
        let quic = unsafe {
            picoquic_create(
                max_connections,
                cert_ptr,
                key_ptr,
                std::ptr::null(),
                alpn.as_ptr(),
                Some(stream_callback),
                registry as *mut c_void,
                None,
                std::ptr::null_mut(),
                seed_ptr,
                picoquic_current_time(),
                std::ptr::null_mut(),
                std::ptr::null(),
                std::ptr::null(),
                0,
            )
        };
        if quic.is_null() {
            // SAFETY: registry came from Box::into_raw above and was never shared.
            drop(unsafe { Box::from_raw(registry) });
            return Err(EngineError::Setup("picoquic_create failed".to_string()));
        }
        Ok(Self {
            quic,
            registry,
            alpn,
            sni,
            stateless: VecDeque::new(),
            reset_tokens: HashMap::new(),
        })
    }

    unsafe fn configure(&self, mtu: u32) {
        picoquic_set_cookie_mode(self.quic, 0);
        picoquic_set_default_priority(self.quic, 2);
        picoquic_set_default_multipath_option(self.quic, 1);
        picoquic_set_preemptive_repeat_policy(self.quic, 1);
        picoquic_disable_port_blocking(self.quic, 1);
        picoquic_set_stream_data_consumption_mode(self.quic, 1);
        picoquic_set_mtu_max(self.quic, mtu);
        picoquic_set_initial_send_mtu(self.quic, mtu, mtu);
        picoquic_enable_path_callbacks_default(self.quic, 1);
        picoquic_set_key_log_file_from_env(self.quic);
    }

    fn registry(&self) -> &Registry {
        // SAFETY: the registry lives as long as self; callbacks only run inside
        // FFI calls made through &mut self, never while this borrow is alive.
        unsafe { &*self.registry }
    }

    fn registry_mut(&mut self) -> &mut Registry {
        // SAFETY: as above, and &mut self rules out other borrows.
        unsafe { &mut *self.registry }
    }

    fn cnx_ptr(&self, cnx: ConnHandle) -> Result<*mut picoquic_cnx_t> {
        self.registry()
            .cnx_by_handle
            .get(&cnx)
            .copied()
            .ok_or(EngineError::UnknownConnection(cnx))
    }

    /// Engine path index for `path`, -1 when the engine no longer knows it
    fn path_index(&self, cnx: *mut picoquic_cnx_t, handle: ConnHandle, path: PathHandle) -> c_int {
        let Some(entry) = self.registry().path_entry(handle, path) else {
            return -1;
        };
        let storage = socket_addr_to_storage(entry.peer);
        // SAFETY: cnx is live and storage outlives the call.
        unsafe { slipstream_find_path_id_by_addr(cnx, &storage as *const _ as *const sockaddr) }
    }

    fn remember_reset_token(&mut self, query: &[u8], answer: &[u8]) {
        let (Some(query), Some(reply)) = (parse_header(query), parse_header(answer)) else {
            return;
        };
        if reply.form != crate::stateless::HeaderForm::Short || answer.len() < RESET_SECRET_LEN {
            return;
        }
        if self.reset_tokens.len() >= RESET_TOKEN_CACHE_MAX {
            self.reset_tokens.clear();
        }
        let mut token = [0u8; RESET_SECRET_LEN];
        token.copy_from_slice(&answer[answer.len() - RESET_SECRET_LEN..]);
        self.reset_tokens.insert(query.dcid.to_vec(), token);
    }
}

impl Drop for PicoquicEngine {
    fn drop(&mut self) {
        // SAFETY: quic and registry were created in `create` and are released once.
        unsafe {
            picoquic_free(self.quic);
            drop(Box::from_raw(self.registry));
        }
    }
}

impl QuicEngine for PicoquicEngine {
    fn now(&self) -> u64 {
        // SAFETY: no preconditions.
        unsafe { picoquic_current_time() }
    }

    fn set_connection_window(&mut self, bytes: u64) {
        // SAFETY: quic is live until drop.
        unsafe { picoquic_set_max_data_control(self.quic, bytes) }
    }

    fn connect(&mut self, peer: SocketAddr, now: u64) -> Result<ConnHandle> {
        let mut storage = socket_addr_to_storage(peer);
        // SAFETY: quic is live; the strings outlive the call and picoquic copies them.
        let cnx = unsafe {
            picoquic_create_client_cnx(
                self.quic,
                &mut storage as *mut _ as *mut sockaddr,
                now,
                QUIC_V1,
                if self.sni.as_bytes().is_empty() {
                    std::ptr::null()
                } else {
                    self.sni.as_ptr()
                },
                self.alpn.as_ptr(),
                Some(stream_callback),
                self.registry as *mut c_void,
            )
        };
        if cnx.is_null() {
            return Err(EngineError::Setup("picoquic_create_client_cnx failed".to_string()));
        }
        let handle = self.registry_mut().handle_for(cnx);
        self.registry_mut().path_for(handle, peer, Some(0));
        // SAFETY: cnx was just created.
        check("picoquic_start_client_cnx", unsafe { picoquic_start_client_cnx(cnx) })?;
        Ok(handle)
    }

    fn incoming_packet(
        &mut self,
        packet: &[u8],
        peer: SocketAddr,
        local: SocketAddr,
        now: u64,
    ) -> Result<Incoming> {
        let mut bytes = packet.to_vec();
        let mut from = socket_addr_to_storage(peer);
        let mut to = socket_addr_to_storage(local);
        let mut first_cnx: *mut picoquic_cnx_t = std::ptr::null_mut();
        let mut first_path: c_int = -1;
        // SAFETY: every buffer is owned by this frame and outlives the call.
        let ret = unsafe {
            picoquic_incoming_packet_ex(
                self.quic,
                bytes.as_mut_ptr(),
                bytes.len(),
                &mut from as *mut _ as *mut sockaddr,
                &mut to as *mut _ as *mut sockaddr,
                0,
                0,
                &mut first_cnx,
                &mut first_path,
                now,
            )
        };
        check("picoquic_incoming_packet_ex", ret)?;

        if first_cnx.is_null() {
            let mut out = vec![0u8; MAX_PACKET_SIZE];
            let mut out_len: size_t = 0;
            // SAFETY: quic is live, the buffers outlive the call.
            let found = unsafe {
                slipstream_take_stateless_packet_for_cid(
                    self.quic,
                    packet.as_ptr(),
                    packet.len(),
                    out.as_mut_ptr(),
                    out.len(),
                    &mut out_len,
                )
            };
            if found > 0 {
                out.truncate(out_len);
                self.remember_reset_token(packet, &out);
                self.stateless.push_back(StatelessPacket { bytes: out, peer });
            }
            return Ok(Incoming::default());
        }

        let registry = self.registry_mut();
        let handle = registry.handle_for(first_cnx);
        let path = registry.path_for(handle, peer, None);
        Ok(Incoming {
            cnx: Some(handle),
            path: Some(path),
        })
    }

    fn prepare_packet(
        &mut self,
        cnx: ConnHandle,
        path: Option<PathHandle>,
        now: u64,
        buf: &mut [u8],
    ) -> Result<Option<PreparedPacket>> {
        let ptr = self.cnx_ptr(cnx)?;
        let path_id = path.map_or(-1, |p| self.path_index(ptr, cnx, p));
        let mut len: size_t = 0;
        // SAFETY: sockaddr_storage is plain old data.
        let mut addr_to: sockaddr_storage = unsafe { std::mem::zeroed() };
        // SAFETY: as above.
        let mut addr_from: sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut if_index: c_int = 0;
        let mut msg_size: size_t = 0;
        // SAFETY: cnx is live and every out parameter outlives the call.
        let ret = unsafe {
            picoquic_prepare_packet_ex(
                ptr,
                path_id,
                now,
                buf.as_mut_ptr(),
                buf.len(),
                &mut len,
                &mut addr_to,
                &mut addr_from,
                &mut if_index,
                &mut msg_size,
            )
        };
        check("picoquic_prepare_packet_ex", ret)?;
        if len == 0 {
            return Ok(None);
        }
        let Some(peer) = storage_to_socket_addr(&addr_to) else {
            return Ok(None);
        };
        let peer = normalize_dual_stack_addr(peer);
        let path = self.registry_mut().path_for(cnx, peer, None);
        Ok(Some(PreparedPacket {
            len,
            peer,
            path: Some(path),
        }))
    }

    fn next_wake_delay(&self, now: u64, max: u64) -> u64 {
        let max = i64::try_from(max).unwrap_or(i64::MAX);
        // SAFETY: quic is live.
        let delay = unsafe { picoquic_get_next_wake_delay(self.quic, now, max) };
        delay.max(0) as u64
    }

    fn request_poll(&mut self, cnx: ConnHandle) {
        if let Ok(ptr) = self.cnx_ptr(cnx) {
            // SAFETY: ptr is a live connection.
            unsafe { slipstream_request_poll(ptr) };
        }
    }

    fn has_ready_stream(&self, cnx: ConnHandle) -> bool {
        self.cnx_ptr(cnx)
            // SAFETY: ptr is a live connection.
            .map(|ptr| unsafe { slipstream_has_ready_stream(ptr) } != 0)
            .unwrap_or(false)
    }

    fn is_flow_blocked(&self, cnx: ConnHandle) -> bool {
        self.cnx_ptr(cnx)
            // SAFETY: ptr is a live connection.
            .map(|ptr| unsafe { slipstream_is_flow_blocked(ptr) } != 0)
            .unwrap_or(false)
    }

    fn path_quality(&self, cnx: ConnHandle, path: Option<PathHandle>) -> PathQuality {
        let Ok(ptr) = self.cnx_ptr(cnx) else {
            return PathQuality::default();
        };
        let unique = path
            .and_then(|p| self.registry().path_entry(cnx, p))
            .and_then(|entry| entry.unique);
        let mut quality = picoquic_path_quality_t::default();
        let mut ret = -1;
        if let Some(unique) = unique {
            // SAFETY: ptr is live and quality is a valid out parameter.
            ret = unsafe { picoquic_get_path_quality(ptr, unique, &mut quality) };
        }
        if ret != 0 {
            // SAFETY: as above.
            unsafe { picoquic_get_default_path_quality(ptr, &mut quality) };
        }
        quality.into()
    }

    fn find_path(&self, cnx: ConnHandle, peer: SocketAddr) -> Option<PathHandle> {
        let ptr = self.cnx_ptr(cnx).ok()?;
        let peer = normalize_dual_stack_addr(peer);
        let entries = self.registry().paths.get(&cnx)?;
        let index = entries.iter().position(|e| e.peer == peer)?;
        let handle = PathHandle(index as u64);
        (self.path_index(ptr, cnx, handle) >= 0).then_some(handle)
    }

    fn probe_path(
        &mut self,
        cnx: ConnHandle,
        peer: SocketAddr,
        local: SocketAddr,
        now: u64,
    ) -> Result<PathHandle> {
        let ptr = self.cnx_ptr(cnx)?;
        let peer_storage = socket_addr_to_storage(peer);
        let local_storage = socket_addr_to_storage(local);
        let mut path_id: c_int = -1;
        // SAFETY: ptr is live and both addresses outlive the call.
        let ret = unsafe {
            picoquic_probe_new_path_ex(
                ptr,
                &peer_storage as *const _ as *const sockaddr,
                &local_storage as *const _ as *const sockaddr,
                0,
                now,
                0,
                &mut path_id,
            )
        };
        check("picoquic_probe_new_path_ex", ret)?;
        Ok(self.registry_mut().path_for(cnx, peer, None))
    }

    fn configure_path(&mut self, cnx: ConnHandle, path: PathHandle, congestion: &PathCongestion) {
        let Ok(ptr) = self.cnx_ptr(cnx) else {
            return;
        };
        let index = self.path_index(ptr, cnx, path);
        if index < 0 {
            log::debug!("{}: path {} not known to engine yet", cnx, path.0);
            return;
        }
        // SAFETY: ptr is live and index names one of its paths.
        unsafe {
            slipstream_set_path_mode(ptr, index, congestion.mode.as_raw());
            slipstream_set_path_ack_delay(ptr, index, congestion.disable_ack_delay as c_int);
        }
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.registry_mut().events.pop_front()
    }

    fn stream_consumed(&mut self, cnx: ConnHandle, stream: StreamId, offset: u64) -> Result<()> {
        let ptr = self.cnx_ptr(cnx)?;
        // SAFETY: ptr is a live connection.
        check("picoquic_stream_data_consumed", unsafe {
            picoquic_stream_data_consumed(ptr, stream, offset)
        })
    }

    fn write_stream(
        &mut self,
        cnx: ConnHandle,
        stream: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<()> {
        let ptr = self.cnx_ptr(cnx)?;
        // SAFETY: ptr is live; picoquic copies the data before returning.
        check("picoquic_add_to_stream", unsafe {
            picoquic_add_to_stream(ptr, stream, data.as_ptr(), data.len(), fin as c_int)
        })
    }

    fn stop_sending(&mut self, cnx: ConnHandle, stream: StreamId, code: u64) -> Result<()> {
        let ptr = self.cnx_ptr(cnx)?;
        // SAFETY: ptr is a live connection.
        check("picoquic_stop_sending", unsafe {
            picoquic_stop_sending(ptr, stream, code)
        })
    }

    fn reset_stream(&mut self, cnx: ConnHandle, stream: StreamId, code: u64) -> Result<()> {
        let ptr = self.cnx_ptr(cnx)?;
        // SAFETY: ptr is a live connection.
        check("picoquic_reset_stream", unsafe {
            picoquic_reset_stream(ptr, stream, code)
        })
    }

    fn close(&mut self, cnx: ConnHandle, code: u64) -> Result<()> {
        let ptr = self.cnx_ptr(cnx)?;
        // SAFETY: ptr is a live connection.
        check("picoquic_close", unsafe { picoquic_close(ptr, code) })
    }

    fn close_immediate(&mut self, cnx: ConnHandle) {
        let Some(ptr) = self.registry_mut().forget(cnx) else {
            return;
        };
        // SAFETY: ptr was live and is no longer reachable through the registry,
        // so the close callback fired by the delete is ignored.
        unsafe {
            picoquic_close_immediate(ptr);
            picoquic_delete_cnx(ptr);
        }
    }

    fn take_stateless_packet(&mut self) -> Option<StatelessPacket> {
        self.stateless.pop_front()
    }

    fn reset_secret(&self, cid: &[u8]) -> Option<[u8; RESET_SECRET_LEN]> {
        if cid.is_empty() {
            return None;
        }
        self.reset_tokens.get(cid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_conversion_keeps_address() {
        let v4: SocketAddr = "192.0.2.10:5353".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        for addr in [v4, v6] {
            let storage = socket_addr_to_storage(addr);
            assert_eq!(storage_to_socket_addr(&storage), Some(addr));
        }
    }

    #[test]
    fn test_registry_handles_are_stable() {
        let mut registry = Registry::default();
        let a = 0x1000 as *mut picoquic_cnx_t;
        let b = 0x2000 as *mut picoquic_cnx_t;
        let ha = registry.handle_for(a);
        let hb = registry.handle_for(b);
        assert_ne!(ha, hb);
        assert_eq!(registry.handle_for(a), ha);

        let peer: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let path = registry.path_for(ha, peer, Some(3));
        assert_eq!(registry.path_by_unique(ha, 3), Some(path));
        assert_eq!(registry.forget(ha), Some(a));
        assert!(registry.path_entry(ha, path).is_none());
        assert_ne!(registry.handle_for(a), ha);
    }

    #[test]
    fn test_pinned_algos_end_with_sentinel() {
        assert_eq!(PINNED_ALGOS.last(), Some(&SIG_ALGO_SENTINEL));
        assert_eq!(&PINNED_ALGOS[..SUPPORTED_SCHEMES.len()], &SUPPORTED_SCHEMES[..]);
    }
}
