//! PC keyboard (8042 controller). The scancode stream is decoded by
//! the pc-keyboard crate instead of hand-written shift/escape tables.

use lazy_static::lazy_static;
use pc_keyboard::{layouts::Us104Key, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

use crate::console::consoleintr;
use crate::x86::inb;

const KBSTATP: u16 = 0x64; // kbd controller status port
const KBS_DIB: u8 = 0x01; // kbd data in buffer
const KBDATAP: u16 = 0x60; // kbd data port

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<Us104Key, ScancodeSet1>> = Mutex::new(Keyboard::new(
        ScancodeSet1::new(),
        Us104Key,
        HandleControl::MapLettersToUnicode,
    ));
}

/// Pull one byte from the controller and run it through the decoder.
/// Returns the decoded character, 0 if the byte did not complete a
/// keypress, or -1 if no data was pending.
unsafe fn kbdgetc() -> i32 {
    let st = inb(KBSTATP);
    if st & KBS_DIB == 0 {
        return -1;
    }
    let data = inb(KBDATAP);

    let mut keyboard = KEYBOARD.lock();
    if let Ok(Some(event)) = keyboard.add_byte(data) {
        if let Some(key) = keyboard.process_keyevent(event) {
            return match key {
                DecodedKey::Unicode(c) => c as i32,
                DecodedKey::RawKey(_) => 0,
            };
        }
    }
    0
}

pub unsafe fn kbdintr() {
    consoleintr(kbdgetc);
}
