use crate::client::ProxyClient;
use crate::protocol::{ChatMessage, ChatRequest, ChatRequestData, Role, StreamData};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use std::io;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 6;
const HEADER_HEIGHT: u16 = 3;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = io::stdout().flush();
    }
}

/// One row of the transcript. Notices are local and never sent to the proxy.
#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Message(ChatMessage),
    Notice(String),
}

/// Conversation state held by the UI for its whole lifetime.
#[derive(Debug, Default)]
pub struct ChatView {
    entries: Vec<Entry>,
    session_id: Option<String>,
    is_loading: bool,
    replying: bool,
}

impl ChatView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Message(message) => Some(message),
            Entry::Notice(_) => None,
        })
    }

    /// Appends the user's message and builds the request for this turn.
    pub fn push_user(&mut self, text: String) -> ChatRequest {
        self.entries.push(Entry::Message(ChatMessage::user(text)));
        self.is_loading = true;
        self.replying = false;

        ChatRequest {
            messages: self.messages().cloned().collect(),
            data: Some(ChatRequestData {
                session_id: self.session_id.clone(),
                ..Default::default()
            }),
        }
    }

    pub fn append_assistant_chunk(&mut self, text: &str) {
        if self.replying {
            if let Some(Entry::Message(message)) = self.entries.last_mut() {
                message.content.push_str(text);
                return;
            }
        }
        self.entries
            .push(Entry::Message(ChatMessage::assistant(text)));
        self.replying = true;
    }

    /// Returns true when the proxy handed back a session we did not hold yet.
    pub fn learn_session(&mut self, data: &StreamData) -> bool {
        if self.session_id.as_deref() == Some(data.session_id.as_str()) {
            return false;
        }
        self.session_id = Some(data.session_id.clone());
        true
    }

    pub fn notice(&mut self, text: impl Into<String>) {
        self.entries.push(Entry::Notice(text.into()));
        self.replying = false;
    }

    pub fn finish_reply(&mut self) {
        self.is_loading = false;
        self.replying = false;
    }

    /// Drops the transcript and the session; the next turn starts a new one.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn title(&self) -> String {
        match self.session_id() {
            Some(id) => format!("Chat: {}...", id.chars().take(8).collect::<String>()),
            None => "New Chat".to_string(),
        }
    }

    fn transcript_lines(&self) -> Vec<Line<'static>> {
        let mut lines = Vec::new();
        for entry in &self.entries {
            lines.extend(entry_lines(entry));
            lines.push(Line::default());
        }
        lines
    }
}

fn entry_lines(entry: &Entry) -> Vec<Line<'static>> {
    match entry {
        Entry::Message(message) => {
            let (label, color, alignment) = match message.role {
                Role::User => ("You", Color::Blue, Alignment::Right),
                Role::Assistant => ("Assistant", Color::Yellow, Alignment::Left),
            };
            let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
            let body_style = Style::default().fg(color);

            let mut lines = vec![Line::styled(label, header_style).alignment(alignment)];
            for line in message.content.lines() {
                lines.push(Line::styled(line.to_string(), body_style).alignment(alignment));
            }
            lines
        }
        Entry::Notice(text) => vec![Line::styled(
            format!("ℹ {}", text),
            Style::default()
                .fg(Color::Gray)
                .add_modifier(Modifier::ITALIC),
        )],
    }
}

// Rows the lines occupy once wrapped to `width`.
fn wrapped_height(lines: &[Line], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let total: usize = lines
        .iter()
        .map(|line| line.width().max(1).div_ceil(width))
        .sum();
    total.min(u16::MAX as usize) as u16
}

#[derive(Debug)]
pub enum UiEvent {
    Session(StreamData),
    Chunk(String),
    Error(String),
    Done,
}

/// Multi-line input with a char-indexed cursor.
struct InputBuffer {
    lines: Vec<String>,
    row: usize,
    col: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            row: 0,
            col: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    fn line_len(&self, row: usize) -> usize {
        self.lines[row].chars().count()
    }

    fn byte_offset(&self) -> usize {
        let line = &self.lines[self.row];
        line.char_indices()
            .nth(self.col)
            .map(|(idx, _)| idx)
            .unwrap_or(line.len())
    }

    fn insert_char(&mut self, c: char) {
        let offset = self.byte_offset();
        self.lines[self.row].insert(offset, c);
        self.col += 1;
    }

    fn delete_char(&mut self) {
        if self.col > 0 {
            self.col -= 1;
            let offset = self.byte_offset();
            self.lines[self.row].remove(offset);
        } else if self.row > 0 {
            let line = self.lines.remove(self.row);
            self.row -= 1;
            self.col = self.line_len(self.row);
            self.lines[self.row].push_str(&line);
        }
    }

    fn new_line(&mut self) {
        let offset = self.byte_offset();
        let rest = self.lines[self.row].split_off(offset);
        self.lines.insert(self.row + 1, rest);
        self.row += 1;
        self.col = 0;
    }

    fn move_left(&mut self) {
        if self.col > 0 {
            self.col -= 1;
        } else if self.row > 0 {
            self.row -= 1;
            self.col = self.line_len(self.row);
        }
    }

    fn move_right(&mut self) {
        if self.col < self.line_len(self.row) {
            self.col += 1;
        } else if self.row + 1 < self.lines.len() {
            self.row += 1;
            self.col = 0;
        }
    }

    fn move_vertical(&mut self, up: bool) {
        let target = if up {
            self.row.checked_sub(1)
        } else {
            Some(self.row + 1).filter(|row| *row < self.lines.len())
        };
        if let Some(row) = target {
            self.row = row;
            self.col = self.col.min(self.line_len(row));
        }
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    // Cursor position in terminal cells once the input is wrapped to `width`.
    fn cursor_offset(&self, width: u16) -> (u16, u16) {
        let width = width.max(1) as usize;
        let rows_above: usize = self.lines[..self.row]
            .iter()
            .map(|line| Line::from(line.as_str()).width().max(1).div_ceil(width))
            .sum();
        let before = Line::from(&self.lines[self.row][..self.byte_offset()]).width();
        let x = before % width;
        let y = rows_above + before / width;
        (x as u16, y.min(u16::MAX as usize) as u16)
    }

    fn is_blank(&self) -> bool {
        self.lines.iter().all(|line| line.trim().is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.lines.iter().all(|line| line.is_empty()) {
            return Text::from(Span::styled(
                "Say something...",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|line| Line::from(line.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

pub struct App {
    view: ChatView,
    input: InputBuffer,
    should_quit: bool,
    sender: mpsc::Sender<UiEvent>,
    receiver: mpsc::Receiver<UiEvent>,
    client: ProxyClient,
}

impl App {
    pub fn new(client: ProxyClient) -> Self {
        let (sender, receiver) = mpsc::channel(100);

        Self {
            view: ChatView::new(),
            input: InputBuffer::new(),
            should_quit: false,
            sender,
            receiver,
            client,
        }
    }

    fn draw(&self, f: &mut Frame) {
        let [header_area, transcript_area, input_area] = Layout::vertical([
            Constraint::Length(HEADER_HEIGHT),
            Constraint::Min(1),
            Constraint::Length(INPUT_HEIGHT),
        ])
        .areas(f.area());

        let header = Paragraph::new(Span::styled(
            self.view.title(),
            Style::default().add_modifier(Modifier::BOLD),
        ))
        .block(Block::default().borders(Borders::BOTTOM));
        f.render_widget(header, header_area);

        let lines = self.view.transcript_lines();
        let scroll = wrapped_height(&lines, transcript_area.width)
            .saturating_sub(transcript_area.height);
        let transcript = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .scroll((scroll, 0));
        f.render_widget(transcript, transcript_area);

        let title = if self.view.is_loading() {
            " Enter to send, Ctrl+N new chat, Esc to quit [Thinking...] "
        } else {
            " Enter to send, Ctrl+N new chat, Esc to quit "
        };
        let input = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(input, input_area);

        self.place_cursor(f, input_area);
    }

    fn place_cursor(&self, f: &mut Frame, area: Rect) {
        let (dx, dy) = self.input.cursor_offset(area.width.saturating_sub(2));
        let x = area
            .x
            .saturating_add(1)
            .saturating_add(dx)
            .min(area.x + area.width.saturating_sub(2));
        let y = area
            .y
            .saturating_add(1)
            .saturating_add(dy)
            .min(area.y + area.height.saturating_sub(2));
        f.set_cursor_position((x, y));
    }

    fn apply(&mut self, event: UiEvent) {
        match event {
            UiEvent::Session(data) => {
                if self.view.learn_session(&data) {
                    tracing::debug!(session_id = %data.session_id, "session learned");
                }
            }
            UiEvent::Chunk(text) => self.view.append_assistant_chunk(&text),
            UiEvent::Error(err) => self.view.notice(format!("Error: {}", err)),
            UiEvent::Done => self.view.finish_reply(),
        }
    }

    fn submit(&mut self) {
        if self.view.is_loading() || self.input.is_blank() {
            return;
        }
        let request = self.view.push_user(self.input.text());
        self.input.clear();

        let client = self.client.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            if let Err(err) = run_turn(&client, &request, &sender).await {
                let _ = sender.send(UiEvent::Error(err.to_string())).await;
            }
            let _ = sender.send(UiEvent::Done).await;
        });
    }

    fn handle_events(&mut self) -> UiResult<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            self.apply(event);
        }

        if !event::poll(Duration::from_millis(50))? {
            return Ok(true);
        }

        let Event::Key(key) = event::read()? else {
            return Ok(true);
        };
        if key.kind != KeyEventKind::Press {
            return Ok(true);
        }

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('c') => {
                    self.should_quit = true;
                    return Ok(false);
                }
                KeyCode::Char('n') if !self.view.is_loading() => {
                    self.view.reset();
                    self.input.clear();
                }
                _ => {}
            }
            return Ok(true);
        }

        match key.code {
            KeyCode::Esc => {
                self.should_quit = true;
                return Ok(false);
            }
            KeyCode::Enter if key.modifiers.contains(KeyModifiers::SHIFT) => {
                self.input.new_line();
            }
            KeyCode::Enter => self.submit(),
            KeyCode::Char(c) => self.input.insert_char(c),
            KeyCode::Backspace => self.input.delete_char(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            KeyCode::Up => self.input.move_vertical(true),
            KeyCode::Down => self.input.move_vertical(false),
            KeyCode::Home => self.input.col = 0,
            KeyCode::End => self.input.col = self.input.line_len(self.input.row),
            _ => {}
        }

        Ok(true)
    }
}

async fn run_turn(
    client: &ProxyClient,
    request: &ChatRequest,
    sender: &mpsc::Sender<UiEvent>,
) -> UiResult<()> {
    let reply = client.send(request).await?;
    if let Some(data) = reply.stream_data() {
        let _ = sender.send(UiEvent::Session(data.clone())).await;
    }

    reply
        .stream_text(|text| {
            let sender = sender.clone();
            async move {
                let _ = sender.send(UiEvent::Chunk(text)).await;
            }
        })
        .await?;

    Ok(())
}

pub fn run_tui(client: ProxyClient) -> UiResult<()> {
    enable_raw_mode()?;
    let _guard = TerminalGuard::new();

    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = App::new(client);

    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events()? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}
