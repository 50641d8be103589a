/*!
Input line discipline.

The container runs with `stty -echo`, so the server owns echo and line editing:

- printable characters (>= 0x20, except DEL) are echoed and buffered;
- `\r` or `\n` forwards the buffered line plus `\n`, echoes `\r\n` and clears the buffer
  (a `\n` directly after `\r` is swallowed, also across events);
- DEL pops the last buffered character, echoes `\b \b` when something was popped and
  forwards the raw DEL;
- any other control character is forwarded immediately without echo. ETX (Ctrl-C) also
  discards the pending line;
- an event that starts with ESC is an escape sequence and is forwarded whole.
*/

const DEL: char = '\u{7f}';
const ESC: char = '\u{1b}';
const ETX: char = '\u{03}';

/// One side effect of feeding input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Text to send back to the client as output.
    Echo(String),
    /// Bytes to write to the container's stdin.
    Forward(Vec<u8>),
}

#[derive(Debug, Default)]
pub struct LineDiscipline {
    line: String,
    after_cr: bool,
}

impl LineDiscipline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending, not yet forwarded line.
    pub fn buffered(&self) -> &str {
        &self.line
    }

    pub fn feed(&mut self, data: &str) -> Vec<Effect> {
        let mut out = Vec::new();
        if data.starts_with(ESC) {
            self.after_cr = false;
            out.push(Effect::Forward(data.as_bytes().to_vec()));
            return out;
        }
        for ch in data.chars() {
            let after_cr = std::mem::replace(&mut self.after_cr, false);
            match ch {
                '\n' if after_cr => {}
                '\r' | '\n' => {
                    self.after_cr = ch == '\r';
                    let mut line = std::mem::take(&mut self.line).into_bytes();
                    line.push(b'\n');
                    out.push(Effect::Forward(line));
                    push_echo(&mut out, "\r\n");
                }
                DEL => {
                    if self.line.pop().is_some() {
                        push_echo(&mut out, "\u{8} \u{8}");
                    }
                    out.push(Effect::Forward(vec![0x7f]));
                }
                c if (c as u32) < 0x20 => {
                    if c == ETX {
                        self.line.clear();
                    }
                    let mut b = [0u8; 4];
                    out.push(Effect::Forward(c.encode_utf8(&mut b).as_bytes().to_vec()));
                }
                c => {
                    self.line.push(c);
                    let mut b = [0u8; 4];
                    push_echo(&mut out, c.encode_utf8(&mut b));
                }
            }
        }
        out
    }
}

fn push_echo(out: &mut Vec<Effect>, s: &str) {
    if let Some(Effect::Echo(prev)) = out.last_mut() {
        prev.push_str(s);
    } else {
        out.push(Effect::Echo(s.to_string()));
    }
}
