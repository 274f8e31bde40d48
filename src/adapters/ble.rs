//! BLE link adapter.
//!
//! Implements [`LinkPort`] on a single GATT service with one command
//! characteristic (peer writes framed fragments) and one response
//! characteristic (we notify chunks back).
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: Bluedroid GATT server via `esp_idf_svc::sys`.
//! - **all other targets**: an in-memory recorder for host-side tests.
//!
//! ## GATT Service Layout
//!
//! | Characteristic | UUID                       | Perms        |
//! |----------------|----------------------------|--------------|
//! | Command        | `6e400002-…-e50e24dcca9e`  | Write        |
//! | Response       | `6e400003-…-e50e24dcca9e`  | Read+Notify  |
//!
//! Fragments are fed to the attached transport straight from the GATTS
//! callback. Connect and disconnect reset the transport's per-connection
//! state in the callback too, so they stay ordered with the writes. The
//! rest of the lifecycle and MTU changes are pushed to the
//! [`crate::events`] queue and handled on the main loop, because the
//! connect path sleeps while the link settles.

use std::sync::{Arc, Weak};

use log::info;

use crate::config::{ATT_OVERHEAD, DEFAULT_ATT_MTU};
use crate::error::LinkError;
use crate::ports::LinkPort;
use crate::transport::GatewayTransport;

// ───────────────────────────────────────────────────────────────
// Constants
// ───────────────────────────────────────────────────────────────

pub const SERVICE_UUID: u128 = 0x6e400001_b5a3_f393_e0a9_e50e24dcca9e;
pub const CHAR_COMMAND: u128 = 0x6e400002_b5a3_f393_e0a9_e50e24dcca9e;
pub const CHAR_RESPONSE: u128 = 0x6e400003_b5a3_f393_e0a9_e50e24dcca9e;

/// Largest payload one notification can carry at `mtu`.
pub fn max_notify_len(mtu: u16) -> usize {
    usize::from(mtu.max(DEFAULT_ATT_MTU) - ATT_OVERHEAD)
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF Bluedroid backend
// ───────────────────────────────────────────────────────────────

// Bluedroid callbacks are C function pointers that cannot capture Rust
// closures. These statics bridge the callback context to the adapter.

#[cfg(target_os = "espidf")]
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering as AtomicOrdering};
#[cfg(target_os = "espidf")]
use std::sync::OnceLock;

#[cfg(target_os = "espidf")]
static BLE_GATTS_IF: AtomicU32 = AtomicU32::new(0);
#[cfg(target_os = "espidf")]
static BLE_CONN_ID: AtomicU32 = AtomicU32::new(0);
#[cfg(target_os = "espidf")]
static BLE_CONNECTED: AtomicBool = AtomicBool::new(false);
#[cfg(target_os = "espidf")]
static BLE_PEER_MTU: AtomicU16 = AtomicU16::new(DEFAULT_ATT_MTU);
#[cfg(target_os = "espidf")]
static BLE_SVC_HANDLE: AtomicU32 = AtomicU32::new(0);
#[cfg(target_os = "espidf")]
static BLE_CMD_CHAR_HANDLE: AtomicU32 = AtomicU32::new(0);
#[cfg(target_os = "espidf")]
static BLE_RSP_CHAR_HANDLE: AtomicU32 = AtomicU32::new(0);
#[cfg(target_os = "espidf")]
static BLE_CHAR_STEP: AtomicU32 = AtomicU32::new(0);

/// Transport fed by the GATTS write callback. Weak so the link does not
/// keep the transport that owns it alive.
#[cfg(target_os = "espidf")]
static BLE_TRANSPORT: OnceLock<Weak<GatewayTransport>> = OnceLock::new();

#[cfg(target_os = "espidf")]
fn uuid128_to_esp(uuid: u128) -> esp_idf_svc::sys::esp_bt_uuid_t {
    let mut t: esp_idf_svc::sys::esp_bt_uuid_t = unsafe { core::mem::zeroed() };
    t.len = 16;
    t.uuid.uuid128 = uuid.to_le_bytes();
    t
}

#[cfg(target_os = "espidf")]
unsafe fn add_gatt_char(svc_handle: u16, uuid: u128, perm: u32, prop: u32) {
    use esp_idf_svc::sys::*;
    let mut char_uuid = uuid128_to_esp(uuid);
    unsafe {
        esp_ble_gatts_add_char(
            svc_handle,
            &mut char_uuid,
            perm as esp_gatt_perm_t,
            prop as esp_gatt_char_prop_t,
            core::ptr::null_mut(),
            core::ptr::null_mut(),
        );
    }
}

#[cfg(target_os = "espidf")]
fn start_advertising() {
    use esp_idf_svc::sys::*;
    // SAFETY: params are fully initialised; Bluedroid copies them.
    unsafe {
        let mut adv_params = esp_ble_adv_params_t {
            adv_int_min: 0x20,
            adv_int_max: 0x40,
            adv_type: esp_ble_adv_type_t_ADV_TYPE_IND,
            own_addr_type: esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
            channel_map: esp_ble_adv_channel_t_ADV_CHNL_ALL,
            adv_filter_policy: esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
            ..core::mem::zeroed()
        };
        esp_ble_gap_start_advertising(&mut adv_params);
    }
}

#[cfg(target_os = "espidf")]
unsafe extern "C" fn ble_gap_event_handler(
    event: esp_idf_svc::sys::esp_gap_ble_cb_event_t,
    _param: *mut esp_idf_svc::sys::esp_ble_gap_cb_param_t,
) {
    use esp_idf_svc::sys::*;
    match event {
        esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
            log::info!("LINK: gap advertising started");
        }
        esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_STOP_COMPLETE_EVT => {
            log::info!("LINK: gap advertising stopped");
        }
        _ => {}
    }
}

#[cfg(target_os = "espidf")]
unsafe extern "C" fn ble_gatts_event_handler(
    event: esp_idf_svc::sys::esp_gatts_cb_event_t,
    gatts_if: esp_idf_svc::sys::esp_gatt_if_t,
    param: *mut esp_idf_svc::sys::esp_ble_gatts_cb_param_t,
) {
    use crate::events::{Event, push_event};
    use esp_idf_svc::sys::*;

    BLE_GATTS_IF.store(u32::from(gatts_if), AtomicOrdering::Relaxed);

    match event {
        esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            log::info!("LINK: gatts app registered (if={})", gatts_if);
            let mut svc_id = esp_gatt_srvc_id_t {
                id: esp_gatt_id_t {
                    uuid: uuid128_to_esp(SERVICE_UUID),
                    inst_id: 0,
                },
                is_primary: true,
            };
            unsafe { esp_ble_gatts_create_service(gatts_if, &mut svc_id, 8) };
        }
        esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => {
            let svc_handle = unsafe { (*param).create.service_handle };
            BLE_SVC_HANDLE.store(u32::from(svc_handle), AtomicOrdering::Relaxed);
            log::info!("LINK: gatts service created (handle={})", svc_handle);
            BLE_CHAR_STEP.store(1, AtomicOrdering::Relaxed);
            unsafe {
                esp_ble_gatts_start_service(svc_handle);
                add_gatt_char(
                    svc_handle,
                    CHAR_COMMAND,
                    ESP_GATT_PERM_WRITE,
                    ESP_GATT_CHAR_PROP_BIT_WRITE | ESP_GATT_CHAR_PROP_BIT_WRITE_NR,
                );
            }
        }
        esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => {
            let handle = unsafe { (*param).add_char.attr_handle };
            let svc_handle = BLE_SVC_HANDLE.load(AtomicOrdering::Relaxed) as u16;
            match BLE_CHAR_STEP.load(AtomicOrdering::Relaxed) {
                1 => {
                    BLE_CMD_CHAR_HANDLE.store(u32::from(handle), AtomicOrdering::Relaxed);
                    log::info!("LINK: gatts command char (handle={})", handle);
                    BLE_CHAR_STEP.store(2, AtomicOrdering::Relaxed);
                    unsafe {
                        add_gatt_char(
                            svc_handle,
                            CHAR_RESPONSE,
                            ESP_GATT_PERM_READ,
                            ESP_GATT_CHAR_PROP_BIT_READ | ESP_GATT_CHAR_PROP_BIT_NOTIFY,
                        );
                    }
                }
                2 => {
                    BLE_RSP_CHAR_HANDLE.store(u32::from(handle), AtomicOrdering::Relaxed);
                    BLE_CHAR_STEP.store(3, AtomicOrdering::Relaxed);
                    log::info!("LINK: gatts response char (handle={}), all registered", handle);
                }
                _ => {}
            }
        }
        esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
            let conn_id = unsafe { (*param).connect.conn_id };
            BLE_CONN_ID.store(u32::from(conn_id), AtomicOrdering::Relaxed);
            BLE_PEER_MTU.store(DEFAULT_ATT_MTU, AtomicOrdering::Relaxed);
            BLE_CONNECTED.store(true, AtomicOrdering::Release);
            log::info!("LINK: gatts client connected (conn_id={})", conn_id);
            if let Some(transport) = BLE_TRANSPORT.get().and_then(Weak::upgrade) {
                transport.on_link_up();
            }
            push_event(Event::LinkConnected);
        }
        esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
            BLE_CONNECTED.store(false, AtomicOrdering::Release);
            BLE_PEER_MTU.store(DEFAULT_ATT_MTU, AtomicOrdering::Relaxed);
            log::info!("LINK: gatts client disconnected");
            if let Some(transport) = BLE_TRANSPORT.get().and_then(Weak::upgrade) {
                transport.on_link_down();
            }
            push_event(Event::LinkDisconnected);
        }
        esp_gatts_cb_event_t_ESP_GATTS_MTU_EVT => {
            let mtu = unsafe { (*param).mtu.mtu };
            BLE_PEER_MTU.store(mtu, AtomicOrdering::Relaxed);
            log::info!("LINK: gatts MTU exchanged ({})", mtu);
            push_event(Event::MtuUpdated);
        }
        esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => {
            let p = unsafe { &(*param).write };
            if p.need_rsp {
                unsafe {
                    esp_ble_gatts_send_response(
                        gatts_if,
                        p.conn_id,
                        p.trans_id,
                        esp_gatt_status_t_ESP_GATT_OK,
                        core::ptr::null_mut(),
                    );
                }
            }
            if u32::from(p.handle) != BLE_CMD_CHAR_HANDLE.load(AtomicOrdering::Relaxed) {
                return;
            }
            let data = unsafe { core::slice::from_raw_parts(p.value, usize::from(p.len)) };
            if let Some(transport) = BLE_TRANSPORT.get().and_then(Weak::upgrade) {
                transport.on_fragment(data);
            }
        }
        _ => {}
    }
}

// ───────────────────────────────────────────────────────────────
// Adapter
// ───────────────────────────────────────────────────────────────

pub struct BleLink {
    device_name: heapless::String<24>,
    #[cfg(not(target_os = "espidf"))]
    sim: sim::SimLink,
}

impl BleLink {
    pub fn new(device_name: heapless::String<24>) -> Self {
        Self {
            device_name,
            #[cfg(not(target_os = "espidf"))]
            sim: sim::SimLink::default(),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Route incoming command fragments to `transport`.
    #[cfg(target_os = "espidf")]
    pub fn attach(&self, transport: &Arc<GatewayTransport>) {
        if BLE_TRANSPORT.set(Arc::downgrade(transport)).is_err() {
            log::warn!("LINK: transport already attached");
        }
    }

    /// Bring up the controller and Bluedroid, register the GATT app and
    /// start advertising.
    #[cfg(target_os = "espidf")]
    pub fn start(&self, preferred_mtu: u16) -> Result<(), LinkError> {
        use esp_idf_svc::sys::*;

        fn check(ret: esp_err_t, what: &str) -> Result<(), LinkError> {
            if ret == ESP_OK as i32 {
                Ok(())
            } else {
                log::error!("LINK: {} failed ({})", what, ret);
                Err(LinkError::Stack(ret))
            }
        }

        // SAFETY: called once from main before any callback can fire.
        unsafe {
            // Release classic BT memory (BLE-only mode saves ~30 KB).
            esp_bt_controller_mem_release(esp_bt_mode_t_ESP_BT_MODE_CLASSIC_BT);

            let mut bt_cfg = esp_bt_controller_config_t::default();
            check(esp_bt_controller_init(&mut bt_cfg), "bt_controller_init")?;
            check(
                esp_bt_controller_enable(esp_bt_mode_t_ESP_BT_MODE_BLE),
                "bt_controller_enable",
            )?;
            check(esp_bluedroid_init(), "bluedroid_init")?;
            check(esp_bluedroid_enable(), "bluedroid_enable")?;

            check(
                esp_ble_gap_register_callback(Some(ble_gap_event_handler)),
                "gap_register_callback",
            )?;
            check(
                esp_ble_gatts_register_callback(Some(ble_gatts_event_handler)),
                "gatts_register_callback",
            )?;
            check(esp_ble_gatts_app_register(0), "gatts_app_register")?;
            check(esp_ble_gatt_set_local_mtu(preferred_mtu), "set_local_mtu")?;

            let mut name = heapless::Vec::<u8, 25>::new();
            let _ = name.extend_from_slice(self.device_name.as_bytes());
            let _ = name.push(0);
            esp_ble_gap_set_device_name(name.as_ptr() as *const _);
        }
        start_advertising();

        info!(
            "LINK: Bluedroid stack initialized, advertising as '{}'",
            self.device_name
        );
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
impl LinkPort for BleLink {
    fn notify(&self, data: &[u8]) -> Result<(), LinkError> {
        use esp_idf_svc::sys::*;

        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let handle = BLE_RSP_CHAR_HANDLE.load(AtomicOrdering::Relaxed);
        if handle == 0 {
            return Err(LinkError::NotConnected);
        }
        if data.len() > max_notify_len(self.mtu()) {
            return Err(LinkError::PayloadTooLarge);
        }
        // SAFETY: Bluedroid copies the value before returning.
        let ret = unsafe {
            esp_ble_gatts_send_indicate(
                BLE_GATTS_IF.load(AtomicOrdering::Relaxed) as esp_gatt_if_t,
                BLE_CONN_ID.load(AtomicOrdering::Relaxed) as u16,
                handle as u16,
                data.len() as u16,
                data.as_ptr() as *mut u8,
                false,
            )
        };
        if ret == ESP_OK as i32 {
            Ok(())
        } else {
            Err(LinkError::Stack(ret))
        }
    }

    fn mtu(&self) -> u16 {
        BLE_PEER_MTU.load(AtomicOrdering::Relaxed)
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), LinkError> {
        // A peripheral cannot start the exchange; raising the local MTU
        // makes the stack accept the peer's next request at that size.
        let ret = unsafe { esp_idf_svc::sys::esp_ble_gatt_set_local_mtu(mtu) };
        if ret == esp_idf_svc::sys::ESP_OK as i32 {
            Ok(())
        } else {
            Err(LinkError::Stack(ret))
        }
    }

    fn is_connected(&self) -> bool {
        BLE_CONNECTED.load(AtomicOrdering::Acquire)
    }

    fn restart_advertising(&self) {
        start_advertising();
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32};
    use std::sync::{OnceLock, Weak};

    use parking_lot::Mutex;

    use crate::config::DEFAULT_ATT_MTU;
    use crate::transport::GatewayTransport;

    pub(super) struct SimLink {
        pub connected: AtomicBool,
        pub mtu: AtomicU16,
        pub requested_mtu: AtomicU16,
        pub adverts: AtomicU32,
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub transport: OnceLock<Weak<GatewayTransport>>,
    }

    impl Default for SimLink {
        fn default() -> Self {
            Self {
                connected: AtomicBool::new(false),
                mtu: AtomicU16::new(DEFAULT_ATT_MTU),
                requested_mtu: AtomicU16::new(0),
                adverts: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
                transport: OnceLock::new(),
            }
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl BleLink {
    pub fn attach(&self, transport: &Arc<GatewayTransport>) {
        if self.sim.transport.set(Arc::downgrade(transport)).is_err() {
            log::warn!("LINK(sim): transport already attached");
        }
    }

    pub fn start(&self, preferred_mtu: u16) -> Result<(), LinkError> {
        use std::sync::atomic::Ordering;
        self.sim.adverts.fetch_add(1, Ordering::Relaxed);
        info!(
            "LINK(sim): advertising '{}' (service {:032x}, local MTU {})",
            self.device_name, SERVICE_UUID, preferred_mtu
        );
        Ok(())
    }

    /// Simulate a central connecting with an initial ATT MTU.
    /// Simulate a peer connecting. Runs the callback half of the
    /// transport's connect; the caller routes the main-loop half.
    pub fn sim_connect(&self, mtu: u16) {
        use std::sync::atomic::Ordering;
        self.sim.mtu.store(mtu, Ordering::Relaxed);
        self.sim.connected.store(true, Ordering::Release);
        if let Some(transport) = self.sim.transport.get().and_then(Weak::upgrade) {
            transport.on_link_up();
        }
    }

    pub fn sim_disconnect(&self) {
        use std::sync::atomic::Ordering;
        self.sim.connected.store(false, Ordering::Release);
        self.sim.mtu.store(DEFAULT_ATT_MTU, Ordering::Relaxed);
        if let Some(transport) = self.sim.transport.get().and_then(Weak::upgrade) {
            transport.on_link_down();
        }
    }

    /// Simulate the peer completing an MTU exchange.
    pub fn sim_set_mtu(&self, mtu: u16) {
        self.sim.mtu.store(mtu, std::sync::atomic::Ordering::Relaxed);
    }

    /// Simulate a GATT write on the command characteristic.
    pub fn sim_write(&self, data: &[u8]) {
        if let Some(transport) = self.sim.transport.get().and_then(Weak::upgrade) {
            transport.on_fragment(data);
        }
    }

    /// Notifications sent since the last call.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.sim.sent.lock())
    }

    pub fn requested_mtu(&self) -> u16 {
        self.sim.requested_mtu.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn advertising_starts(&self) -> u32 {
        self.sim.adverts.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(not(target_os = "espidf"))]
impl LinkPort for BleLink {
    fn notify(&self, data: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if data.len() > max_notify_len(self.mtu()) {
            return Err(LinkError::PayloadTooLarge);
        }
        self.sim.sent.lock().push(data.to_vec());
        Ok(())
    }

    fn mtu(&self) -> u16 {
        self.sim.mtu.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), LinkError> {
        self.sim
            .requested_mtu
            .store(mtu, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.sim.connected.load(std::sync::atomic::Ordering::Acquire)
    }

    fn restart_advertising(&self) {
        self.sim
            .adverts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!("LINK(sim): advertising restarted");
    }
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────
