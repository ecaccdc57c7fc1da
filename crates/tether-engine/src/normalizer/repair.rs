//! Locating and repairing JSON objects embedded in model output.

/// Substring from the first `{` through the last `}`, if both exist in order.
pub fn direct_candidate(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Best-effort repair of a malformed or truncated JSON object.
///
/// Strips fence markers and leading prose, keeps the first balanced object,
/// and when the input is cut short either closes an open value string or
/// backs up to the last complete value before appending the missing
/// closers. Trailing commas are removed last. Returns `None` when no object
/// start is present or nothing salvageable precedes the truncation.
pub fn repair(text: &str) -> Option<String> {
    let unfenced = strip_fences(text);
    let start = unfenced.find('{')?;
    let body = &unfenced[start..];
    let balanced = close_object(body)?;
    Some(remove_trailing_commas(&balanced))
}

/// Drop lines that are only a fence marker (```` ``` ```` or ```` ```json ````).
fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Clone)]
struct CutPoint {
    end: usize,
    stack: Vec<char>,
}

fn closers(stack: &[char]) -> String {
    stack
        .iter()
        .rev()
        .map(|open| if *open == '{' { '}' } else { ']' })
        .collect()
}

fn close_object(body: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escaped = false;
    let mut expect_key = false;
    let mut last_cut: Option<CutPoint> = None;

    for (i, c) in body.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                if !string_is_key {
                    last_cut = Some(CutPoint {
                        end: i + 1,
                        stack: stack.clone(),
                    });
                }
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                string_is_key = expect_key && stack.last() == Some(&'{');
            }
            '{' | '[' => {
                stack.push(c);
                expect_key = c == '{';
                last_cut = Some(CutPoint {
                    end: i + 1,
                    stack: stack.clone(),
                });
            }
            '}' | ']' => {
                stack.pop();
                if stack.is_empty() {
                    return Some(body[..=i].to_string());
                }
                expect_key = false;
                last_cut = Some(CutPoint {
                    end: i + 1,
                    stack: stack.clone(),
                });
            }
            ':' => expect_key = false,
            ',' => {
                last_cut = Some(CutPoint {
                    end: i,
                    stack: stack.clone(),
                });
                expect_key = stack.last() == Some(&'{');
            }
            _ => {}
        }
    }

    // truncated: the object never closed
    if in_string && !string_is_key {
        let mut out = body.to_string();
        if escaped {
            out.pop();
        }
        out.push('"');
        out.push_str(&closers(&stack));
        return Some(out);
    }

    let cut = last_cut?;
    let mut out = body[..cut.end].trim_end().trim_end_matches(',').to_string();
    out.push_str(&closers(&cut.stack));
    Some(out)
}

/// Remove commas directly followed (after whitespace) by `}` or `]`,
/// ignoring string contents.
fn remove_trailing_commas(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}
