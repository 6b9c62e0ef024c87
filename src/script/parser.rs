//! Recursive-descent parser for GNU linker scripts, version scripts, and
//! dynamic lists.

use crate::error::{Error, Result};
use crate::script::command::{
    AssignOp, Assignment, AssignmentKind, AssignmentLevel, Constraint, Epilog, InputSectDesc,
    InputSectPolicy, InputSectSpec, InputSectionFlagsSpec, MemoryDesc, OutputSectCommand,
    OutputSectDesc, PhdrSpec, Prolog, RegionAttrs, ScriptCommand, ScriptSectionType,
    SectionsCommand,
};
use crate::script::expression::{BinaryOp, BuiltinFn, Expression, UnaryOp};
use crate::script::lexer::{parse_number, Lexer, Token};
use crate::script::wildcard::{PatternRegistry, SortPolicy, WildcardPattern};
use crate::script::VersionScriptNode;
use crate::section::SectionFlags;

/// Map a PHDRS type keyword to `p_type`
fn phdr_type(word: &str) -> Option<u32> {
    Some(match word {
        "PT_NULL" => 0,
        "PT_LOAD" => 1,
        "PT_DYNAMIC" => 2,
        "PT_INTERP" => 3,
        "PT_NOTE" => 4,
        "PT_SHLIB" => 5,
        "PT_PHDR" => 6,
        "PT_TLS" => 7,
        "PT_GNU_EH_FRAME" => 0x6474_e550,
        "PT_GNU_STACK" => 0x6474_e551,
        "PT_GNU_RELRO" => 0x6474_e552,
        _ => return None,
    })
}

/// Map an `INPUT_SECTION_FLAGS` name to its bit
fn section_flag(word: &str) -> Option<SectionFlags> {
    Some(match word {
        "SHF_WRITE" => SectionFlags::WRITE,
        "SHF_ALLOC" => SectionFlags::ALLOC,
        "SHF_EXECINSTR" => SectionFlags::EXECINSTR,
        "SHF_MERGE" => SectionFlags::MERGE,
        "SHF_STRINGS" => SectionFlags::STRINGS,
        "SHF_INFO_LINK" => SectionFlags::INFO_LINK,
        "SHF_LINK_ORDER" => SectionFlags::LINK_ORDER,
        "SHF_GROUP" => SectionFlags::GROUP,
        "SHF_TLS" => SectionFlags::TLS,
        "SHF_COMPRESSED" => SectionFlags::COMPRESSED,
        "SHF_GNU_RETAIN" => SectionFlags::GNU_RETAIN,
        "SHF_EXCLUDE" => SectionFlags::EXCLUDE,
        _ => return None,
    })
}

/// Parses one script source into commands, registering every wildcard
/// pattern it creates
pub struct Parser<'a, 'r> {
    lexer: Lexer<'a>,
    registry: &'r mut PatternRegistry,
}

impl<'a, 'r> Parser<'a, 'r> {
    /// Parse a whole linker script
    pub fn parse(
        src: &'a str,
        path: &str,
        registry: &'r mut PatternRegistry,
    ) -> Result<Vec<ScriptCommand>> {
        let mut parser = Parser { lexer: Lexer::new(src, path), registry };
        let mut commands = Vec::new();
        while !parser.lexer.at_eof() {
            if let Some(cmd) = parser.parse_command()? {
                commands.push(cmd);
            }
        }
        Ok(commands)
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::LinkerScriptSemantic { context: self.lexer.path.clone(), reason: reason.into() }
    }

    fn register(&mut self, pattern: &str, sort: SortPolicy) -> WildcardPattern {
        self.registry.register(WildcardPattern::new(pattern, sort))
    }

    fn word_or_err(&mut self, what: &str) -> Result<String> {
        self.lexer
            .next_word()
            .ok_or_else(|| self.error(format!("expected {what}")))
    }

    // ---------------- top level ----------------

    fn parse_command(&mut self) -> Result<Option<ScriptCommand>> {
        if let Token::Semicolon = self.lexer.peek_token()? {
            let _ = self.lexer.next_token();
            return Ok(None);
        }
        let Some(word) = self.lexer.next_word() else {
            let tok = self.lexer.next_token()?;
            if tok == Token::Eof {
                return Ok(None);
            }
            return Err(self.error(format!("unexpected {tok:?} at file scope")));
        };
        match word.as_str() {
            "ENTRY" => {
                self.lexer.expect(Token::LParen)?;
                let sym = self.word_or_err("entry symbol")?;
                self.lexer.expect(Token::RParen)?;
                Ok(Some(ScriptCommand::Entry(sym)))
            }
            "SECTIONS" => {
                self.lexer.expect(Token::LBrace)?;
                Ok(Some(ScriptCommand::Sections(self.parse_sections_body()?)))
            }
            "PHDRS" => {
                self.lexer.expect(Token::LBrace)?;
                Ok(Some(ScriptCommand::Phdrs(self.parse_phdrs_body()?)))
            }
            "MEMORY" => {
                self.lexer.expect(Token::LBrace)?;
                Ok(Some(ScriptCommand::Memory(self.parse_memory_body()?)))
            }
            "INPUT" => Ok(Some(ScriptCommand::Input(self.parse_name_list()?))),
            "GROUP" => Ok(Some(ScriptCommand::Group(self.parse_name_list()?))),
            "OUTPUT" => {
                self.lexer.expect(Token::LParen)?;
                let name = self.word_or_err("output name")?;
                self.lexer.expect(Token::RParen)?;
                Ok(Some(ScriptCommand::Output(name)))
            }
            "OUTPUT_FORMAT" => Ok(Some(ScriptCommand::OutputFormat(self.parse_name_list()?))),
            "OUTPUT_ARCH" => {
                self.lexer.expect(Token::LParen)?;
                let name = self.word_or_err("arch name")?;
                self.lexer.expect(Token::RParen)?;
                Ok(Some(ScriptCommand::OutputArch(name)))
            }
            "SEARCH_DIR" => {
                self.lexer.expect(Token::LParen)?;
                let dir = self.word_or_err("directory")?;
                self.lexer.expect(Token::RParen)?;
                Ok(Some(ScriptCommand::SearchDir(dir)))
            }
            "EXTERN" => Ok(Some(ScriptCommand::Extern(self.parse_name_list()?))),
            "ASSERT" => Ok(Some(ScriptCommand::Assignment(
                self.parse_assert(AssignmentLevel::OutsideSections)?,
            ))),
            "PROVIDE" | "PROVIDE_HIDDEN" | "HIDDEN" => Ok(Some(ScriptCommand::Assignment(
                self.parse_wrapped_assignment(&word, AssignmentLevel::OutsideSections)?,
            ))),
            _ => {
                let assignment = self
                    .parse_assignment_tail(word, AssignmentLevel::OutsideSections)?
                    .ok_or_else(|| self.error("expected a command or assignment"))?;
                Ok(Some(ScriptCommand::Assignment(assignment)))
            }
        }
    }

    fn parse_name_list(&mut self) -> Result<Vec<String>> {
        self.lexer.expect(Token::LParen)?;
        let mut names = Vec::new();
        loop {
            match self.lexer.peek_token()? {
                Token::RParen => {
                    let _ = self.lexer.next_token();
                    return Ok(names);
                }
                Token::Comma => {
                    let _ = self.lexer.next_token();
                }
                Token::Eof => return Err(self.error("unterminated list")),
                _ => {
                    // AS_NEEDED(...) groups nest one level.
                    let word = self.word_or_err("name")?;
                    if word == "AS_NEEDED" {
                        let inner = self.parse_name_list()?;
                        names.extend(inner);
                    } else {
                        names.push(word);
                    }
                }
            }
        }
    }

    // ---------------- assignments ----------------

    fn assign_op(token: &Token) -> Option<AssignOp> {
        match token {
            Token::Assign => Some(AssignOp::Assign),
            Token::AddAssign => Some(AssignOp::Add),
            Token::SubAssign => Some(AssignOp::Sub),
            Token::MulAssign => Some(AssignOp::Mul),
            Token::DivAssign => Some(AssignOp::Div),
            Token::ShlAssign => Some(AssignOp::Shl),
            Token::ShrAssign => Some(AssignOp::Shr),
            Token::AndAssign => Some(AssignOp::And),
            Token::OrAssign => Some(AssignOp::Or),
            _ => None,
        }
    }

    /// Parse `<op> expr ;` after the assigned name was consumed. Returns
    /// `None` when the next token is not an assignment operator.
    fn parse_assignment_tail(
        &mut self,
        name: String,
        level: AssignmentLevel,
    ) -> Result<Option<Assignment>> {
        let peeked = self.lexer.peek_token()?;
        let Some(op) = Self::assign_op(&peeked) else {
            return Ok(None);
        };
        let _ = self.lexer.next_token();
        let expr = self.parse_expression()?;
        // The trailing `;` is conventionally present; tolerate its absence
        // before a closing brace.
        if self.lexer.peek_token()? == Token::Semicolon {
            let _ = self.lexer.next_token();
        }
        let mut assignment = Assignment::new(level, name, expr);
        assignment.op = op;
        Ok(Some(assignment))
    }

    fn parse_wrapped_assignment(
        &mut self,
        keyword: &str,
        level: AssignmentLevel,
    ) -> Result<Assignment> {
        self.lexer.expect(Token::LParen)?;
        let name = self.word_or_err("symbol name")?;
        let mut assignment = self
            .parse_assignment_tail(name, level)?
            .ok_or_else(|| self.error(format!("malformed {keyword}")))?;
        self.lexer.expect(Token::RParen)?;
        if self.lexer.peek_token()? == Token::Semicolon {
            let _ = self.lexer.next_token();
        }
        assignment.kind = match keyword {
            "PROVIDE" => AssignmentKind::Provide,
            "PROVIDE_HIDDEN" => AssignmentKind::ProvideHidden,
            _ => AssignmentKind::Hidden,
        };
        Ok(assignment)
    }

    fn parse_assert(&mut self, level: AssignmentLevel) -> Result<Assignment> {
        self.lexer.expect(Token::LParen)?;
        let expr = self.parse_expression()?;
        self.lexer.expect(Token::Comma)?;
        let message = match self.lexer.next_token()? {
            Token::Str(s) => s,
            Token::Word(s) => s,
            other => return Err(self.error(format!("expected assert message, found {other:?}"))),
        };
        self.lexer.expect(Token::RParen)?;
        if self.lexer.peek_token()? == Token::Semicolon {
            let _ = self.lexer.next_token();
        }
        let mut assignment = Assignment::new(level, "", expr);
        assignment.kind = AssignmentKind::Assert;
        assignment.message = Some(message);
        Ok(assignment)
    }

    // ---------------- expressions ----------------

    /// Parse a full expression
    pub fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expression> {
        let cond = self.parse_binary(0)?;
        if self.lexer.peek_token()? != Token::Question {
            return Ok(cond);
        }
        let _ = self.lexer.next_token();
        let then = self.parse_ternary()?;
        self.lexer.expect(Token::Colon)?;
        let otherwise = self.parse_ternary()?;
        Ok(Expression::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn binary_op(token: &Token) -> Option<(BinaryOp, u8)> {
        match token {
            Token::PipePipe => Some((BinaryOp::LogicalOr, 1)),
            Token::AmpAmp => Some((BinaryOp::LogicalAnd, 2)),
            Token::Pipe => Some((BinaryOp::BitOr, 3)),
            Token::Caret => Some((BinaryOp::BitXor, 4)),
            Token::Amp => Some((BinaryOp::BitAnd, 5)),
            Token::EqEq => Some((BinaryOp::Eq, 6)),
            Token::Ne => Some((BinaryOp::Ne, 6)),
            Token::Lt => Some((BinaryOp::Lt, 7)),
            Token::Le => Some((BinaryOp::Le, 7)),
            Token::Gt => Some((BinaryOp::Gt, 7)),
            Token::Ge => Some((BinaryOp::Ge, 7)),
            Token::Shl => Some((BinaryOp::Shl, 8)),
            Token::Shr => Some((BinaryOp::Shr, 8)),
            Token::Plus => Some((BinaryOp::Add, 9)),
            Token::Minus => Some((BinaryOp::Sub, 9)),
            Token::Star => Some((BinaryOp::Mul, 10)),
            Token::Slash => Some((BinaryOp::Div, 10)),
            Token::Percent => Some((BinaryOp::Rem, 10)),
            _ => None,
        }
    }

    fn parse_binary(&mut self, min_bp: u8) -> Result<Expression> {
        let mut lhs = self.parse_unary()?;
        loop {
            let peeked = self.lexer.peek_token()?;
            let Some((op, bp)) = Self::binary_op(&peeked) else { break };
            if bp < min_bp {
                break;
            }
            let _ = self.lexer.next_token();
            let rhs = self.parse_binary(bp + 1)?;
            lhs = Expression::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        let op = match self.lexer.peek_token()? {
            Token::Minus => Some(UnaryOp::Neg),
            Token::Bang => Some(UnaryOp::Not),
            Token::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let _ = self.lexer.next_token();
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary { op, operand: Box::new(operand) });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        match self.lexer.next_token()? {
            Token::LParen => {
                let inner = self.parse_expression()?;
                self.lexer.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Word(word) => {
                if word == "." {
                    return Ok(Expression::Dot);
                }
                if let Some(value) = parse_number(&word) {
                    return Ok(Expression::Number(value));
                }
                if let Some(func) = BuiltinFn::from_name(&word) {
                    if func == BuiltinFn::SizeOfHeaders {
                        return Ok(Expression::Call { func, args: Vec::new() });
                    }
                    if self.lexer.peek_token()? == Token::LParen {
                        return self.parse_builtin_call(func);
                    }
                }
                Ok(Expression::Symbol(word))
            }
            Token::Str(word) => Ok(Expression::Name(word)),
            other => Err(self.error(format!("expected expression, found {other:?}"))),
        }
    }

    fn parse_builtin_call(&mut self, func: BuiltinFn) -> Result<Expression> {
        self.lexer.expect(Token::LParen)?;
        let takes_name = matches!(
            func,
            BuiltinFn::Addr
                | BuiltinFn::AlignOf
                | BuiltinFn::LoadAddr
                | BuiltinFn::SizeOf
                | BuiltinFn::Defined
                | BuiltinFn::Origin
                | BuiltinFn::Length
                | BuiltinFn::SegmentStart
        );
        let mut args = Vec::new();
        if takes_name {
            let name = self.word_or_err("name argument")?;
            args.push(Expression::Name(name));
        } else if self.lexer.peek_token()? != Token::RParen {
            args.push(self.parse_expression()?);
        }
        while self.lexer.peek_token()? == Token::Comma {
            let _ = self.lexer.next_token();
            args.push(self.parse_expression()?);
        }
        self.lexer.expect(Token::RParen)?;
        Ok(Expression::Call { func, args })
    }

    // ---------------- SECTIONS ----------------

    fn parse_sections_body(&mut self) -> Result<Vec<SectionsCommand>> {
        let mut commands = Vec::new();
        loop {
            if self.lexer.peek_token()? == Token::RBrace {
                let _ = self.lexer.next_token();
                return Ok(commands);
            }
            if self.lexer.peek_token()? == Token::Semicolon {
                let _ = self.lexer.next_token();
                continue;
            }
            let Some(word) = self.lexer.next_word() else {
                return Err(self.error("unterminated SECTIONS"));
            };
            match word.as_str() {
                "ENTRY" => {
                    self.lexer.expect(Token::LParen)?;
                    let sym = self.word_or_err("entry symbol")?;
                    self.lexer.expect(Token::RParen)?;
                    commands.push(SectionsCommand::Entry(sym));
                }
                "ASSERT" => commands.push(SectionsCommand::Assignment(
                    self.parse_assert(AssignmentLevel::OutputSection)?,
                )),
                "PROVIDE" | "PROVIDE_HIDDEN" | "HIDDEN" => {
                    commands.push(SectionsCommand::Assignment(
                        self.parse_wrapped_assignment(&word, AssignmentLevel::OutputSection)?,
                    ))
                }
                _ => {
                    if let Some(assignment) =
                        self.parse_assignment_tail(word.clone(), AssignmentLevel::OutputSection)?
                    {
                        commands.push(SectionsCommand::Assignment(assignment));
                    } else {
                        commands.push(SectionsCommand::OutputSection(
                            self.parse_output_section(word)?,
                        ));
                    }
                }
            }
        }
    }

    fn parse_output_section(&mut self, name: String) -> Result<OutputSectDesc> {
        let mut prolog = Prolog::default();
        // Prolog: optional address expression and/or (TYPE) before `:`.
        loop {
            match self.lexer.peek_token()? {
                Token::Colon => {
                    let _ = self.lexer.next_token();
                    break;
                }
                Token::LParen => {
                    let save = self.lexer.save();
                    let _ = self.lexer.next_token();
                    if let Token::Word(type_word) = self.lexer.peek_token()? {
                        let section_type = match type_word.as_str() {
                            "NOLOAD" => Some(ScriptSectionType::NoLoad),
                            "DSECT" => Some(ScriptSectionType::DSect),
                            "COPY" => Some(ScriptSectionType::Copy),
                            "INFO" => Some(ScriptSectionType::Info),
                            "OVERLAY" => Some(ScriptSectionType::Overlay),
                            _ => None,
                        };
                        if let Some(t) = section_type {
                            let _ = self.lexer.next_token();
                            self.lexer.expect(Token::RParen)?;
                            prolog.section_type = Some(t);
                            continue;
                        }
                    }
                    self.lexer.restore(save);
                    prolog.vma = Some(self.parse_expression()?);
                }
                _ => {
                    if prolog.vma.is_some() {
                        return Err(self.error(format!("malformed prolog for section {name}")));
                    }
                    prolog.vma = Some(self.parse_expression()?);
                }
            }
        }
        // Post-colon attributes up to `{`.
        loop {
            match self.lexer.peek_token()? {
                Token::LBrace => {
                    let _ = self.lexer.next_token();
                    break;
                }
                Token::Word(word) => match word.as_str() {
                    "AT" => {
                        let _ = self.lexer.next_token();
                        self.lexer.expect(Token::LParen)?;
                        prolog.lma = Some(self.parse_expression()?);
                        self.lexer.expect(Token::RParen)?;
                    }
                    "ALIGN" => {
                        let _ = self.lexer.next_token();
                        self.lexer.expect(Token::LParen)?;
                        prolog.align = Some(self.parse_expression()?);
                        self.lexer.expect(Token::RParen)?;
                    }
                    "SUBALIGN" => {
                        let _ = self.lexer.next_token();
                        self.lexer.expect(Token::LParen)?;
                        prolog.subalign = Some(self.parse_expression()?);
                        self.lexer.expect(Token::RParen)?;
                    }
                    "ONLY_IF_RO" => {
                        let _ = self.lexer.next_token();
                        prolog.constraint = Constraint::OnlyIfRo;
                    }
                    "ONLY_IF_RW" => {
                        let _ = self.lexer.next_token();
                        prolog.constraint = Constraint::OnlyIfRw;
                    }
                    "PLUGIN" => {
                        let _ = self.lexer.next_token();
                        self.lexer.expect(Token::LParen)?;
                        prolog.plugin = Some(self.word_or_err("plugin name")?);
                        self.lexer.expect(Token::RParen)?;
                    }
                    _ => {
                        return Err(self.error(format!(
                            "unexpected `{word}` before `{{` of section {name}"
                        )))
                    }
                },
                other => {
                    return Err(self.error(format!(
                        "unexpected {other:?} before `{{` of section {name}"
                    )))
                }
            }
        }
        let commands = self.parse_output_section_body()?;
        let epilog = self.parse_epilog()?;
        Ok(OutputSectDesc { name, prolog, commands, epilog })
    }

    fn parse_output_section_body(&mut self) -> Result<Vec<OutputSectCommand>> {
        let mut commands = Vec::new();
        loop {
            match self.lexer.peek_token()? {
                Token::RBrace => {
                    let _ = self.lexer.next_token();
                    return Ok(commands);
                }
                Token::Semicolon => {
                    let _ = self.lexer.next_token();
                    continue;
                }
                Token::Eof => return Err(self.error("unterminated output section body")),
                _ => {}
            }
            let Some(word) = self.lexer.next_word() else {
                return Err(self.error("expected a section body command"));
            };
            match word.as_str() {
                "ASSERT" => commands.push(OutputSectCommand::Assign(
                    self.parse_assert(AssignmentLevel::InputSection)?,
                )),
                "PROVIDE" | "PROVIDE_HIDDEN" | "HIDDEN" => {
                    commands.push(OutputSectCommand::Assign(
                        self.parse_wrapped_assignment(&word, AssignmentLevel::InputSection)?,
                    ))
                }
                "FILL" => {
                    self.lexer.expect(Token::LParen)?;
                    let expr = self.parse_expression()?;
                    self.lexer.expect(Token::RParen)?;
                    if self.lexer.peek_token()? == Token::Semicolon {
                        let _ = self.lexer.next_token();
                    }
                    let mut assignment =
                        Assignment::new(AssignmentLevel::InputSection, "", expr);
                    assignment.kind = AssignmentKind::Fill;
                    commands.push(OutputSectCommand::Assign(assignment));
                }
                "BYTE" | "SHORT" | "LONG" | "QUAD" => {
                    let size = match word.as_str() {
                        "BYTE" => 1,
                        "SHORT" => 2,
                        "LONG" => 4,
                        _ => 8,
                    };
                    self.lexer.expect(Token::LParen)?;
                    let expr = self.parse_expression()?;
                    self.lexer.expect(Token::RParen)?;
                    if self.lexer.peek_token()? == Token::Semicolon {
                        let _ = self.lexer.next_token();
                    }
                    commands.push(OutputSectCommand::Data { size, expr });
                }
                "KEEP" => {
                    self.lexer.expect(Token::LParen)?;
                    let first = self.word_or_err("input description")?;
                    let desc = self.parse_input_desc(first, InputSectPolicy::Keep)?;
                    self.lexer.expect(Token::RParen)?;
                    commands.push(OutputSectCommand::Input(desc));
                }
                _ => {
                    if let Some(assignment) =
                        self.parse_assignment_tail(word.clone(), AssignmentLevel::InputSection)?
                    {
                        commands.push(OutputSectCommand::Assign(assignment));
                    } else {
                        commands.push(OutputSectCommand::Input(
                            self.parse_input_desc(word, InputSectPolicy::NoKeep)?,
                        ));
                    }
                }
            }
        }
    }

    fn parse_input_desc(&mut self, first: String, policy: InputSectPolicy) -> Result<InputSectDesc> {
        let mut flags = None;
        let mut file_word = first;
        if file_word == "INPUT_SECTION_FLAGS" {
            flags = Some(self.parse_flag_spec()?);
            file_word = self.word_or_err("file pattern")?;
        }
        let file = self.register(&file_word, SortPolicy::None);
        let mut archive_member = None;
        if self.lexer.peek_token()? == Token::Colon {
            let _ = self.lexer.next_token();
            let member = self.word_or_err("archive member pattern")?;
            archive_member = Some(self.register(&member, SortPolicy::None));
        }
        self.lexer.expect(Token::LParen)?;
        let mut sections = Vec::new();
        let mut exclude_files = Vec::new();
        loop {
            if self.lexer.peek_token()? == Token::RParen {
                let _ = self.lexer.next_token();
                break;
            }
            let Some(word) = self.lexer.next_word() else {
                return Err(self.error("unterminated input section list"));
            };
            match word.as_str() {
                "EXCLUDE_FILE" => {
                    self.lexer.expect(Token::LParen)?;
                    while self.lexer.peek_token()? != Token::RParen {
                        let excluded = self.word_or_err("excluded file")?;
                        exclude_files.push(self.register(&excluded, SortPolicy::None));
                    }
                    let _ = self.lexer.next_token();
                }
                "SORT" | "SORT_BY_NAME" | "SORT_BY_ALIGNMENT" | "SORT_NONE"
                | "SORT_BY_INIT_PRIORITY" => {
                    sections.push(self.parse_sorted_pattern(&word)?);
                }
                _ => sections.push(self.register(&word, SortPolicy::None)),
            }
        }
        Ok(InputSectDesc {
            policy,
            spec: InputSectSpec { file, archive_member, sections, exclude_files, flags },
        })
    }

    fn parse_sorted_pattern(&mut self, keyword: &str) -> Result<WildcardPattern> {
        self.lexer.expect(Token::LParen)?;
        let outer = match keyword {
            "SORT" | "SORT_BY_NAME" => SortPolicy::ByName,
            "SORT_BY_ALIGNMENT" => SortPolicy::ByAlignment,
            "SORT_BY_INIT_PRIORITY" => SortPolicy::ByInitPriority,
            _ => SortPolicy::None,
        };
        let word = self.word_or_err("sorted pattern")?;
        let sort = match (keyword, word.as_str()) {
            ("SORT_BY_NAME", "SORT_BY_ALIGNMENT") | ("SORT", "SORT_BY_ALIGNMENT") => {
                Some(SortPolicy::ByNameAlignment)
            }
            ("SORT_BY_ALIGNMENT", "SORT_BY_NAME") => Some(SortPolicy::ByAlignmentName),
            _ => None,
        };
        let pattern = if let Some(sort) = sort {
            self.lexer.expect(Token::LParen)?;
            let inner = self.word_or_err("sorted pattern")?;
            self.lexer.expect(Token::RParen)?;
            self.register(&inner, sort)
        } else {
            self.register(&word, outer)
        };
        self.lexer.expect(Token::RParen)?;
        Ok(pattern)
    }

    fn parse_flag_spec(&mut self) -> Result<InputSectionFlagsSpec> {
        self.lexer.expect(Token::LParen)?;
        let mut spec = InputSectionFlagsSpec::default();
        loop {
            match self.lexer.next_token()? {
                Token::RParen => return Ok(spec),
                Token::Amp => {}
                Token::Bang => {
                    let Token::Word(word) = self.lexer.next_token()? else {
                        return Err(self.error("expected a flag name after `!`"));
                    };
                    let flag = section_flag(&word)
                        .ok_or_else(|| self.error(format!("unknown section flag {word}")))?;
                    spec.without |= flag;
                }
                Token::Word(word) => {
                    let flag = section_flag(&word)
                        .ok_or_else(|| self.error(format!("unknown section flag {word}")))?;
                    spec.with |= flag;
                }
                other => return Err(self.error(format!("unexpected {other:?} in flag spec"))),
            }
        }
    }

    fn parse_epilog(&mut self) -> Result<Epilog> {
        let mut epilog = Epilog::default();
        loop {
            match self.lexer.peek_token()? {
                Token::Gt => {
                    let _ = self.lexer.next_token();
                    epilog.region = Some(self.word_or_err("memory region")?);
                }
                Token::Word(word) if word == "AT" => {
                    let save = self.lexer.save();
                    let _ = self.lexer.next_token();
                    if self.lexer.peek_token()? == Token::Gt {
                        let _ = self.lexer.next_token();
                        epilog.lma_region = Some(self.word_or_err("memory region")?);
                    } else {
                        self.lexer.restore(save);
                        break;
                    }
                }
                Token::Colon => {
                    let _ = self.lexer.next_token();
                    epilog.phdrs.push(self.word_or_err("phdr name")?);
                }
                Token::Assign => {
                    let _ = self.lexer.next_token();
                    epilog.fill = Some(self.parse_fill_expression()?);
                }
                Token::Comma | Token::Semicolon => {
                    let _ = self.lexer.next_token();
                    break;
                }
                _ => break,
            }
        }
        Ok(epilog)
    }

    /// A fill value after `=` in an epilog. Restricted to a primary (or a
    /// parenthesized expression) because an unbracketed expression would
    /// swallow the next output section's name.
    fn parse_fill_expression(&mut self) -> Result<Expression> {
        match self.lexer.peek_token()? {
            Token::LParen => {
                let _ = self.lexer.next_token();
                let inner = self.parse_expression()?;
                self.lexer.expect(Token::RParen)?;
                Ok(inner)
            }
            _ => match self.lexer.next_token()? {
                Token::Word(word) => parse_number(&word)
                    .map(Expression::Number)
                    .ok_or_else(|| self.error(format!("expected a fill value, found `{word}`"))),
                other => Err(self.error(format!("expected a fill value, found {other:?}"))),
            },
        }
    }

    // ---------------- PHDRS / MEMORY ----------------

    fn parse_phdrs_body(&mut self) -> Result<Vec<PhdrSpec>> {
        let mut specs = Vec::new();
        loop {
            if self.lexer.peek_token()? == Token::RBrace {
                let _ = self.lexer.next_token();
                return Ok(specs);
            }
            let name = self.word_or_err("phdr name")?;
            let type_word = self.word_or_err("phdr type")?;
            let p_type = phdr_type(&type_word)
                .or_else(|| parse_number(&type_word).map(|n| n as u32))
                .ok_or_else(|| self.error(format!("unknown phdr type {type_word}")))?;
            let mut spec = PhdrSpec {
                name,
                p_type,
                has_filehdr: false,
                has_phdrs: false,
                at: None,
                flags: None,
            };
            loop {
                match self.lexer.peek_token()? {
                    Token::Semicolon => {
                        let _ = self.lexer.next_token();
                        break;
                    }
                    Token::Word(word) => match word.as_str() {
                        "FILEHDR" => {
                            let _ = self.lexer.next_token();
                            spec.has_filehdr = true;
                        }
                        "PHDRS" => {
                            let _ = self.lexer.next_token();
                            spec.has_phdrs = true;
                        }
                        "AT" => {
                            let _ = self.lexer.next_token();
                            self.lexer.expect(Token::LParen)?;
                            spec.at = Some(self.parse_expression()?);
                            self.lexer.expect(Token::RParen)?;
                        }
                        "FLAGS" => {
                            let _ = self.lexer.next_token();
                            self.lexer.expect(Token::LParen)?;
                            spec.flags = Some(self.parse_expression()?);
                            self.lexer.expect(Token::RParen)?;
                        }
                        _ => return Err(self.error(format!("unexpected `{word}` in PHDRS"))),
                    },
                    other => return Err(self.error(format!("unexpected {other:?} in PHDRS"))),
                }
            }
            specs.push(spec);
        }
    }

    fn parse_memory_body(&mut self) -> Result<Vec<MemoryDesc>> {
        let mut regions = Vec::new();
        loop {
            if self.lexer.peek_token()? == Token::RBrace {
                let _ = self.lexer.next_token();
                return Ok(regions);
            }
            let name = self.word_or_err("memory region name")?;
            let mut attrs = RegionAttrs::empty();
            if self.lexer.peek_token()? == Token::LParen {
                let _ = self.lexer.next_token();
                let mut text = String::new();
                loop {
                    match self.lexer.next_token()? {
                        Token::RParen => break,
                        Token::Word(w) => text.push_str(&w),
                        Token::Bang => text.push('!'),
                        other => {
                            return Err(self.error(format!("unexpected {other:?} in attributes")))
                        }
                    }
                }
                attrs = RegionAttrs::parse(&text);
            }
            self.lexer.expect(Token::Colon)?;
            let origin = self.parse_region_field(&["ORIGIN", "org", "o"])?;
            self.lexer.expect(Token::Comma)?;
            let length = self.parse_region_field(&["LENGTH", "len", "l"])?;
            if self.lexer.peek_token()? == Token::Semicolon {
                let _ = self.lexer.next_token();
            }
            regions.push(MemoryDesc { name, attrs, origin, length });
        }
    }

    fn parse_region_field(&mut self, keywords: &[&str]) -> Result<Expression> {
        let word = self.word_or_err("region field")?;
        if !keywords.contains(&word.as_str()) {
            return Err(self.error(format!("expected one of {keywords:?}, found `{word}`")));
        }
        self.lexer.expect(Token::Assign)?;
        self.parse_expression()
    }
}

/// Parse a version script into its (single, possibly anonymous) node
pub fn parse_version_script(
    src: &str,
    path: &str,
    registry: &mut PatternRegistry,
) -> Result<VersionScriptNode> {
    let mut lexer = Lexer::new(src, path);
    let mut node = VersionScriptNode::default();
    // Optional version tag before `{`.
    if let Token::Word(_) = lexer.peek_token()? {
        let _ = lexer.next_word();
    }
    lexer.expect(Token::LBrace).map_err(|_| Error::VersionScriptParse {
        line: 1,
        reason: "expected `{`".into(),
    })?;
    let mut into_local = false;
    loop {
        match lexer.peek_token()? {
            Token::RBrace => {
                let _ = lexer.next_token();
                break;
            }
            Token::Semicolon => {
                let _ = lexer.next_token();
            }
            Token::Eof => {
                return Err(Error::VersionScriptParse {
                    line: 0,
                    reason: "unterminated version node".into(),
                })
            }
            _ => {
                let Some(word) = lexer.next_word() else {
                    return Err(Error::VersionScriptParse {
                        line: 0,
                        reason: "expected a symbol pattern".into(),
                    });
                };
                if (word == "global" || word == "local") && lexer.peek_token()? == Token::Colon {
                    let _ = lexer.next_token();
                    into_local = word == "local";
                    continue;
                }
                if word == "extern" {
                    // `extern "C++" { ... }`: patterns inside keep the
                    // current bucket.
                    if let Token::Str(_) = lexer.peek_token()? {
                        let _ = lexer.next_token();
                    }
                    lexer.expect(Token::LBrace)?;
                    continue;
                }
                let pattern = registry.register(WildcardPattern::new(word, SortPolicy::None));
                if into_local {
                    node.locals.push(pattern);
                } else {
                    node.globals.push(pattern);
                }
            }
        }
    }
    if lexer.peek_token()? == Token::Semicolon {
        let _ = lexer.next_token();
    }
    Ok(node)
}

/// Parse a dynamic list: `{ pattern; pattern; };`
pub fn parse_dynamic_list(
    src: &str,
    path: &str,
    registry: &mut PatternRegistry,
) -> Result<Vec<WildcardPattern>> {
    let mut lexer = Lexer::new(src, path);
    lexer.expect(Token::LBrace)?;
    let mut patterns = Vec::new();
    loop {
        match lexer.peek_token()? {
            Token::RBrace => {
                let _ = lexer.next_token();
                return Ok(patterns);
            }
            Token::Semicolon => {
                let _ = lexer.next_token();
            }
            Token::Eof => {
                return Err(Error::VersionScriptParse {
                    line: 0,
                    reason: "unterminated dynamic list".into(),
                })
            }
            _ => {
                let Some(word) = lexer.next_word() else {
                    return Err(Error::VersionScriptParse {
                        line: 0,
                        reason: "expected a symbol pattern".into(),
                    });
                };
                patterns.push(registry.register(WildcardPattern::new(word, SortPolicy::None)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Vec<ScriptCommand> {
        let mut registry = PatternRegistry::default();
        Parser::parse(src, "test.ld", &mut registry).unwrap()
    }

    #[test]
    fn parses_entry_and_assignment() {
        let cmds = parse("ENTRY(_start)\n__stack = 0x80000;\n");
        assert_eq!(cmds.len(), 2);
        assert!(matches!(&cmds[0], ScriptCommand::Entry(e) if e == "_start"));
        match &cmds[1] {
            ScriptCommand::Assignment(a) => {
                assert_eq!(a.name, "__stack");
                assert_eq!(a.expr, Expression::Number(0x80000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_sections_with_rules_and_epilog() {
        let cmds = parse(
            "SECTIONS {\n\
               . = 0x400000;\n\
               .text : AT(0x100000) ALIGN(16) {\n\
                 *(.text .text.*)\n\
                 KEEP(*(.init))\n\
               } >ram AT>rom :text =0x90\n\
               /DISCARD/ : { *(.note.junk) }\n\
             }",
        );
        let ScriptCommand::Sections(body) = &cmds[0] else { panic!("not SECTIONS") };
        assert_eq!(body.len(), 3);
        let SectionsCommand::OutputSection(text) = &body[1] else { panic!("not a section") };
        assert_eq!(text.name, ".text");
        assert!(text.prolog.lma.is_some());
        assert!(text.prolog.align.is_some());
        assert_eq!(text.commands.len(), 2);
        match &text.commands[0] {
            OutputSectCommand::Input(desc) => {
                assert_eq!(desc.policy, InputSectPolicy::NoKeep);
                assert!(desc.spec.file.is_match_all());
                assert_eq!(desc.spec.sections.len(), 2);
                assert_eq!(desc.spec.sections[1].pattern, ".text.*");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &text.commands[1] {
            OutputSectCommand::Input(desc) => assert_eq!(desc.policy, InputSectPolicy::Keep),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(text.epilog.region.as_deref(), Some("ram"));
        assert_eq!(text.epilog.lma_region.as_deref(), Some("rom"));
        assert_eq!(text.epilog.phdrs, vec!["text".to_string()]);
        assert!(text.epilog.fill.is_some());
        let SectionsCommand::OutputSection(discard) = &body[2] else { panic!("not a section") };
        assert!(discard.is_discard());
    }

    #[test]
    fn parses_phdrs_and_memory() {
        let cmds = parse(
            "PHDRS { text PT_LOAD FILEHDR PHDRS ; data PT_LOAD AT(0x100) FLAGS(6) ; }\n\
             MEMORY { ram (rwx) : ORIGIN = 0x10000, LENGTH = 64K\n\
                      rom (rx) : org = 0x0, len = 0x8000 }",
        );
        let ScriptCommand::Phdrs(phdrs) = &cmds[0] else { panic!("not PHDRS") };
        assert_eq!(phdrs.len(), 2);
        assert!(phdrs[0].has_filehdr && phdrs[0].has_phdrs);
        assert_eq!(phdrs[1].p_type, 1);
        assert!(phdrs[1].at.is_some());
        let ScriptCommand::Memory(regions) = &cmds[1] else { panic!("not MEMORY") };
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].name, "ram");
        assert!(regions[0].attrs.contains(RegionAttrs::EXEC));
        assert_eq!(regions[1].length, Expression::Number(0x8000));
    }

    #[test]
    fn parses_provide_and_assert() {
        let cmds = parse(
            "PROVIDE(__heap_size = 0x1000);\n\
             ASSERT(__heap_size >= 0x400, \"heap too small\")\n",
        );
        let ScriptCommand::Assignment(provide) = &cmds[0] else { panic!() };
        assert_eq!(provide.kind, AssignmentKind::Provide);
        let ScriptCommand::Assignment(assert_cmd) = &cmds[1] else { panic!() };
        assert_eq!(assert_cmd.kind, AssignmentKind::Assert);
        assert_eq!(assert_cmd.message.as_deref(), Some("heap too small"));
    }

    #[test]
    fn parses_sorted_and_excluded_patterns() {
        let cmds = parse(
            "SECTIONS { .init_array : {\n\
               KEEP(*(SORT_BY_INIT_PRIORITY(.init_array.*)))\n\
               *(EXCLUDE_FILE(*crtend.o) .ctors)\n\
             } }",
        );
        let ScriptCommand::Sections(body) = &cmds[0] else { panic!() };
        let SectionsCommand::OutputSection(sec) = &body[0] else { panic!() };
        let OutputSectCommand::Input(keep) = &sec.commands[0] else { panic!() };
        assert_eq!(keep.spec.sections[0].sort, SortPolicy::ByInitPriority);
        let OutputSectCommand::Input(ctors) = &sec.commands[1] else { panic!() };
        assert_eq!(ctors.spec.exclude_files.len(), 1);
        assert_eq!(ctors.spec.exclude_files[0].pattern, "*crtend.o");
    }

    #[test]
    fn parses_version_script_buckets() {
        let mut registry = PatternRegistry::default();
        let node = parse_version_script(
            "{ global: foo; bar_*; local: *; };",
            "v.map",
            &mut registry,
        )
        .unwrap();
        assert_eq!(node.globals.len(), 2);
        assert_eq!(node.locals.len(), 1);
        assert!(node.locals[0].is_match_all());
    }

    #[test]
    fn parses_input_section_flags() {
        let cmds = parse(
            "SECTIONS { .data : { INPUT_SECTION_FLAGS(SHF_ALLOC & !SHF_EXECINSTR) *(.data*) } }",
        );
        let ScriptCommand::Sections(body) = &cmds[0] else { panic!() };
        let SectionsCommand::OutputSection(sec) = &body[0] else { panic!() };
        let OutputSectCommand::Input(desc) = &sec.commands[0] else { panic!() };
        let flags = desc.spec.flags.as_ref().unwrap();
        assert!(flags.with.contains(SectionFlags::ALLOC));
        assert!(flags.without.contains(SectionFlags::EXECINSTR));
    }
}
