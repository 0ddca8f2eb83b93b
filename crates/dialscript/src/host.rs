//! Host interface: the capability set the VM consumes.
//!
//! The VM owns a single `Box<dyn Host>` for its lifetime and reaches the
//! outside world only through it. Every method has a neutral default so a
//! host implements just the subsystems its hardware has; the [`NullHost`]
//! implements nothing and is useful for headless runs.
//!
//! Timers, `system.sleep`, `system.yield`, and callback registration are
//! *not* host methods — the VM handles those natives internally and only
//! asks the host for the clock.
//!
//! Colors are 16-bit RGB565 zero-extended into the 32-bit operand.

/// Host capabilities, one method per native operation.
#[allow(unused_variables)]
pub trait Host {
    // --- Console ---
    fn console_print(&mut self, text: &str) {}
    fn console_println(&mut self, text: &str) {}
    fn console_log(&mut self, text: &str) {}
    fn console_warn(&mut self, text: &str) {}
    fn console_error(&mut self, text: &str) {}
    fn console_clear(&mut self) {}

    // --- Display ---
    fn display_clear(&mut self, color: u32) {}
    fn display_draw_pixel(&mut self, x: i32, y: i32, color: u32) {}
    fn display_draw_line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, color: u32) {}
    fn display_draw_rect(&mut self, x: i32, y: i32, w: i32, h: i32, color: u32, filled: bool) {}
    fn display_draw_circle(&mut self, x: i32, y: i32, r: i32, color: u32, filled: bool) {}
    fn display_draw_text(&mut self, x: i32, y: i32, text: &str, color: u32, size: i32) {}
    fn display_draw_image(&mut self, x: i32, y: i32, data: &str) {}
    fn display_set_brightness(&mut self, level: i32) {}
    fn display_set_title(&mut self, title: &str) {}
    fn display_get_width(&mut self) -> i32 {
        0
    }
    fn display_get_height(&mut self) -> i32 {
        0
    }

    // --- Rotary encoder ---
    fn encoder_get_button(&mut self) -> bool {
        false
    }
    fn encoder_get_delta(&mut self) -> i32 {
        0
    }
    fn encoder_get_position(&mut self) -> i32 {
        0
    }
    fn encoder_reset(&mut self) {}

    // --- Touch ---
    fn touch_is_pressed(&mut self) -> bool {
        false
    }
    fn touch_get_x(&mut self) -> i32 {
        0
    }
    fn touch_get_y(&mut self) -> i32 {
        0
    }

    // --- RFID ---
    fn rfid_is_present(&mut self) -> bool {
        false
    }
    fn rfid_read(&mut self) -> String {
        String::new()
    }

    // --- System clock ---
    /// Milliseconds since boot. Also drives VM timers and sleep deadlines.
    fn system_get_time(&mut self) -> u32 {
        0
    }
    /// Seconds since the Unix epoch.
    fn system_get_rtc(&mut self) -> u32 {
        0
    }
    fn system_set_rtc(&mut self, epoch: u32) {}

    // --- Files ---
    fn file_open(&mut self, path: &str, mode: &str) -> i32 {
        -1
    }
    fn file_read(&mut self, handle: i32, size: i32) -> String {
        String::new()
    }
    fn file_write(&mut self, handle: i32, data: &str) -> i32 {
        -1
    }
    fn file_close(&mut self, handle: i32) {}
    fn file_exists(&mut self, path: &str) -> bool {
        false
    }
    fn file_delete(&mut self, path: &str) -> bool {
        false
    }
    fn file_size(&mut self, path: &str) -> i32 {
        -1
    }

    // --- Directories ---
    fn dir_list(&mut self, path: &str) -> Vec<String> {
        Vec::new()
    }
    fn dir_create(&mut self, path: &str) -> bool {
        false
    }
    fn dir_delete(&mut self, path: &str) -> bool {
        false
    }
    fn dir_exists(&mut self, path: &str) -> bool {
        false
    }

    // --- GPIO ---
    fn gpio_pin_mode(&mut self, pin: i32, mode: i32) {}
    fn gpio_digital_write(&mut self, pin: i32, value: bool) {}
    fn gpio_digital_read(&mut self, pin: i32) -> bool {
        false
    }
    fn gpio_analog_read(&mut self, pin: i32) -> i32 {
        0
    }
    fn gpio_analog_write(&mut self, pin: i32, value: i32) {}

    // --- I2C ---
    fn i2c_begin(&mut self, address: i32) -> bool {
        false
    }
    fn i2c_write(&mut self, address: i32, data: &str) -> i32 {
        -1
    }
    fn i2c_read(&mut self, address: i32, size: i32) -> String {
        String::new()
    }
    fn i2c_scan(&mut self) -> Vec<i32> {
        Vec::new()
    }

    // --- Buzzer ---
    fn buzzer_tone(&mut self, frequency: i32, duration_ms: i32) {}
    fn buzzer_no_tone(&mut self) {}
    fn buzzer_beep(&mut self) {}

    // --- Memory ---
    fn memory_get_free(&mut self) -> i32 {
        0
    }
    fn memory_get_used(&mut self) -> i32 {
        0
    }

    // --- Power ---
    /// Battery level 0..100.
    fn power_get_battery_level(&mut self) -> i32 {
        100
    }
    fn power_is_charging(&mut self) -> bool {
        false
    }
    fn power_reboot(&mut self) {}

    // --- Key-value storage ---
    fn storage_get(&mut self, key: &str) -> Option<String> {
        None
    }
    fn storage_set(&mut self, key: &str, value: &str) {}
    fn storage_remove(&mut self, key: &str) {}
    fn storage_clear(&mut self) {}

    // --- Sensors ---
    /// Degrees Celsius ×100.
    fn sensor_read_temperature(&mut self) -> i32 {
        0
    }
    fn sensor_read_light(&mut self) -> i32 {
        0
    }

    // --- WiFi ---
    fn wifi_connect(&mut self, ssid: &str, password: &str) -> bool {
        false
    }
    fn wifi_disconnect(&mut self) {}
    fn wifi_is_connected(&mut self) -> bool {
        false
    }
    fn wifi_get_ip(&mut self) -> String {
        String::new()
    }

    // --- HTTP ---
    fn http_get(&mut self, url: &str) -> String {
        String::new()
    }
    fn http_post(&mut self, url: &str, body: &str) -> String {
        String::new()
    }

    // --- IPC ---
    fn ipc_send(&mut self, channel: &str, message: &str) -> bool {
        false
    }
    fn ipc_receive(&mut self, channel: &str) -> Option<String> {
        None
    }

    // --- App registry ---
    fn app_exit(&mut self) {}
    fn app_launch(&mut self, name: &str) -> bool {
        false
    }
    fn app_list(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// A host with no capabilities at all; every operation is a no-op with a
/// neutral return.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {}

/// A host that records console output and answers the clock from a settable
/// value. Used by tests and headless embedding.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub console: Vec<String>,
    pub now_ms: u32,
    pub storage: std::collections::HashMap<String, String>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for RecordingHost {
    fn console_print(&mut self, text: &str) {
        self.console.push(text.to_string());
    }

    fn console_println(&mut self, text: &str) {
        self.console.push(format!("{text}\n"));
    }

    fn console_log(&mut self, text: &str) {
        self.console.push(format!("[log] {text}"));
    }

    fn console_warn(&mut self, text: &str) {
        self.console.push(format!("[warn] {text}"));
    }

    fn console_error(&mut self, text: &str) {
        self.console.push(format!("[error] {text}"));
    }

    fn console_clear(&mut self) {
        self.console.clear();
    }

    fn system_get_time(&mut self) -> u32 {
        self.now_ms
    }

    fn storage_get(&mut self, key: &str) -> Option<String> {
        self.storage.get(key).cloned()
    }

    fn storage_set(&mut self, key: &str, value: &str) {
        self.storage.insert(key.to_string(), value.to_string());
    }

    fn storage_remove(&mut self, key: &str) {
        self.storage.remove(key);
    }

    fn storage_clear(&mut self) {
        self.storage.clear();
    }
}
